//! Hardware input/output backend boundary.
//!
//! The pipeline core only talks to devices through [`HardwareBackend`]. One
//! backend instance drives one area: its scan outputs and its detector inputs
//! share a sample clock described by [`ClockSpec`].
//!
//! # Start protocol
//!
//! ```text
//!   configure_outputs ─┐
//!   configure_inputs  ─┴─► (Daq stage Running)
//!                                   │ orchestrator, per start order
//!                           start(Inputs) / start(Outputs)
//!                                   │
//!               master start(Outputs) fires the shared trigger
//!                                   │
//!                      read_chunk returns data on every area
//! ```
//!
//! Backends are selected at construction time (`hardware::mock` ships with the
//! crate); vendor bindings implement the same trait out of tree.

pub mod mock;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::scanner::SampleSequences;

/// How an area's tasks are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Starting the output task emits the common trigger
    #[default]
    Master,
    /// Tasks wait for the master's trigger
    Slave,
    /// Tasks wait for a trigger from outside the system
    External,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Master => write!(f, "master"),
            TriggerMode::Slave => write!(f, "slave"),
            TriggerMode::External => write!(f, "external"),
        }
    }
}

/// Which hardware task `start` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Detector sampling
    Inputs,
    /// Scan waveform output
    Outputs,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Inputs => write!(f, "inputs"),
            TaskKind::Outputs => write!(f, "outputs"),
        }
    }
}

/// Shared sample clock of an area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSpec {
    /// Samples per second, identical for inputs and outputs
    pub sample_rate_hz: f64,
    /// Role in the synchronized start
    pub trigger: TriggerMode,
}

/// Detector input configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Number of detector channels sampled together
    pub channels: usize,
    /// Samples per channel returned by one `read_chunk`
    pub chunk_samples: usize,
}

/// Samples returned by one `read_chunk`, one vector per input channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleBlock {
    /// Per-channel samples, all the same length
    pub channels: Vec<Vec<u16>>,
}

impl SampleBlock {
    /// Samples per channel.
    pub fn samples(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }
}

/// Contract every device backend satisfies.
///
/// Methods take `&self`; the Daq stage drives the backend from its own thread
/// while the orchestrator issues `start`/`stop`, so implementations
/// synchronise internally.
pub trait HardwareBackend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Load one output cycle. Called before any task is started.
    fn configure_outputs(&self, sequences: &SampleSequences, clock: &ClockSpec) -> AppResult<()>;

    /// Configure detector sampling on the same clock as the outputs.
    fn configure_inputs(&self, channels: &ChannelSpec, clock: &ClockSpec) -> AppResult<()>;

    /// Start one task. A master's output start is the common trigger.
    fn start(&self, task: TaskKind) -> AppResult<()>;

    /// Stop all tasks and release any caller blocked in `configure_*` or `read_chunk`.
    fn stop(&self) -> AppResult<()>;

    /// Block up to `timeout` for the next chunk of input samples.
    ///
    /// Returns [`DaqError::Timeout`](crate::error::DaqError::Timeout) if no
    /// data arrived, for example while still waiting for the trigger.
    fn read_chunk(&self, timeout: Duration) -> AppResult<SampleBlock>;
}
