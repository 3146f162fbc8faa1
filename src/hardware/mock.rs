//! Simulated hardware backend.
//!
//! [`MockBackend`] replays the programmed scan outputs through a synthetic
//! detector so assembled images are predictable: the signal on every channel
//! rises with the X and Y output voltage. Areas built with the same
//! [`TriggerLine`] share a trigger, and every state change is appended to an
//! [`EventLog`] so tests can check the order of the start protocol.
//!
//! Fault injection covers the paths real devices fail on: slow or failing
//! configuration and a fault in the middle of an acquisition.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::{
    ChannelSpec, ClockSpec, HardwareBackend, SampleBlock, TaskKind, TriggerMode,
};
use crate::scanner::SampleSequences;

/// Behaviour knobs for the simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MockOptions {
    /// Time `configure_outputs` takes, in milliseconds
    pub configure_delay_ms: u64,
    /// Fail `configure_outputs` with this message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_configure: Option<String>,
    /// Report a hardware fault after this many chunks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_after_chunks: Option<u64>,
    /// Deliver chunks no faster than the sample clock
    pub pace: bool,
    /// Peak uniform noise added to each sample, in counts
    pub noise_counts: u16,
}

/// Trigger shared by synchronized areas.
///
/// Fired by the master's output start (or by hand for external triggering);
/// re-armed when the trigger-owning area (master or external) configures its
/// inputs.
#[derive(Debug, Clone, Default)]
pub struct TriggerLine {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl TriggerLine {
    /// Unfired trigger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the trigger, releasing every waiter.
    pub fn fire(&self) {
        let (fired, cv) = &*self.inner;
        *fired.lock() = true;
        cv.notify_all();
    }

    /// Re-arm for the next acquisition.
    pub fn reset(&self) {
        *self.inner.0.lock() = false;
    }

    /// Whether the trigger has fired.
    pub fn is_fired(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Wait for the trigger until `deadline`. Returns whether it fired.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let (fired, cv) = &*self.inner;
        let mut fired = fired.lock();
        while !*fired {
            if cv.wait_until(&mut fired, deadline).timed_out() {
                return *fired;
            }
        }
        true
    }
}

/// What happened on a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `configure_outputs` completed
    OutputsConfigured,
    /// `configure_inputs` completed
    InputsConfigured,
    /// Input task started
    InputsStarted,
    /// Output task started
    OutputsStarted,
    /// Master trigger emitted
    TriggerFired,
    /// All tasks stopped
    Stopped,
}

/// One entry in the [`EventLog`].
#[derive(Debug, Clone, Copy)]
pub struct HardwareEvent {
    /// Area of the device
    pub area: usize,
    /// Event kind
    pub kind: EventKind,
    /// When it happened
    pub at: Instant,
}

/// Ordered record of device events across areas.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<HardwareEvent>>>,
}

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, area: usize, kind: EventKind) {
        self.events.lock().push(HardwareEvent {
            area,
            kind,
            at: Instant::now(),
        });
    }

    /// Snapshot of all events in order.
    pub fn events(&self) -> Vec<HardwareEvent> {
        self.events.lock().clone()
    }

    /// Index of the first `kind` event for `area`.
    pub fn position(&self, area: usize, kind: EventKind) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .position(|e| e.area == area && e.kind == kind)
    }

    /// Whether any area recorded `kind`.
    pub fn contains(&self, kind: EventKind) -> bool {
        self.events.lock().iter().any(|e| e.kind == kind)
    }
}

#[derive(Default)]
struct MockState {
    x: Vec<f64>,
    y: Vec<f64>,
    clock: Option<ClockSpec>,
    inputs: Option<ChannelSpec>,
    inputs_running: bool,
    outputs_running: bool,
    interrupted: bool,
    cursor: u64,
    chunks: u64,
    triggered_at: Option<Instant>,
}

/// Simulated output/input device pair for one area.
pub struct MockBackend {
    area: usize,
    name: String,
    scan_range_volts: f64,
    options: MockOptions,
    trigger: TriggerLine,
    log: EventLog,
    state: Mutex<MockState>,
    wake: Condvar,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("area", &self.area)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl MockBackend {
    /// Backend for `area` wired to a shared trigger and event log.
    pub fn new(
        area: usize,
        scan_range_volts: f64,
        options: MockOptions,
        trigger: TriggerLine,
        log: EventLog,
    ) -> Self {
        Self {
            area,
            name: format!("mock-area{}", area),
            scan_range_volts,
            options,
            trigger,
            log,
            state: Mutex::new(MockState::default()),
            wake: Condvar::new(),
        }
    }

    /// Shared trigger line.
    pub fn trigger(&self) -> &TriggerLine {
        &self.trigger
    }

    /// Shared event log.
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Chunks delivered since the input task started.
    pub fn chunks_read(&self) -> u64 {
        self.state.lock().chunks
    }

    /// Detector counts for a scan position.
    fn detector_value(&self, x: f64, y: f64, channel: usize) -> u16 {
        let nx = (x / self.scan_range_volts + 1.0) / 2.0;
        let ny = (y / self.scan_range_volts + 1.0) / 2.0;
        let mut value = 1000.0 + 20_000.0 * nx + 5_000.0 * ny + 1_000.0 * channel as f64;
        if self.options.noise_counts > 0 {
            value += f64::from(rand::thread_rng().gen_range(0..=self.options.noise_counts));
        }
        value.round().clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

impl HardwareBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_outputs(&self, sequences: &SampleSequences, clock: &ClockSpec) -> AppResult<()> {
        let mut state = self.state.lock();
        state.interrupted = false;

        if self.options.configure_delay_ms > 0 {
            let deadline = Instant::now() + Duration::from_millis(self.options.configure_delay_ms);
            debug!(area = self.area, delay_ms = self.options.configure_delay_ms, "Simulating slow configure");
            while !state.interrupted {
                if self.wake.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.interrupted {
                return Err(DaqError::HardwareFault(format!(
                    "area {} configuration interrupted",
                    self.area
                )));
            }
        }

        if let Some(reason) = &self.options.fail_configure {
            return Err(DaqError::HardwareFault(reason.clone()));
        }

        state.x = sequences.x.clone();
        state.y = sequences.y.clone();
        state.clock = Some(*clock);
        state.inputs_running = false;
        state.outputs_running = false;
        drop(state);

        self.log.record(self.area, EventKind::OutputsConfigured);
        debug!(area = self.area, samples = sequences.len(), "Outputs configured");
        Ok(())
    }

    fn configure_inputs(&self, channels: &ChannelSpec, clock: &ClockSpec) -> AppResult<()> {
        if channels.channels == 0 || channels.chunk_samples == 0 {
            return Err(DaqError::HardwareFault(
                "input task needs at least one channel and sample".into(),
            ));
        }
        let mut state = self.state.lock();
        state.inputs = Some(*channels);
        state.clock = Some(*clock);
        drop(state);

        if matches!(clock.trigger, TriggerMode::Master | TriggerMode::External) {
            self.trigger.reset();
        }
        self.log.record(self.area, EventKind::InputsConfigured);
        Ok(())
    }

    fn start(&self, task: TaskKind) -> AppResult<()> {
        let mut state = self.state.lock();
        let trigger = match task {
            TaskKind::Inputs => {
                if state.inputs.is_none() {
                    return Err(DaqError::HardwareFault("inputs not configured".into()));
                }
                state.inputs_running = true;
                state.cursor = 0;
                state.chunks = 0;
                state.triggered_at = None;
                None
            }
            TaskKind::Outputs => {
                if state.x.is_empty() {
                    return Err(DaqError::HardwareFault("outputs not configured".into()));
                }
                state.outputs_running = true;
                state.clock.map(|c| c.trigger)
            }
        };
        drop(state);
        self.wake.notify_all();

        let kind = match task {
            TaskKind::Inputs => EventKind::InputsStarted,
            TaskKind::Outputs => EventKind::OutputsStarted,
        };
        self.log.record(self.area, kind);
        if trigger == Some(TriggerMode::Master) {
            self.trigger.fire();
            self.log.record(self.area, EventKind::TriggerFired);
            info!(area = self.area, "Master trigger fired");
        }
        Ok(())
    }

    fn stop(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        let was_running = state.inputs_running || state.outputs_running;
        state.inputs_running = false;
        state.outputs_running = false;
        state.interrupted = true;
        drop(state);
        self.wake.notify_all();
        if was_running {
            self.log.record(self.area, EventKind::Stopped);
        }
        Ok(())
    }

    fn read_chunk(&self, timeout: Duration) -> AppResult<SampleBlock> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.state.lock();
            while !state.inputs_running {
                if state.interrupted || self.wake.wait_until(&mut state, deadline).timed_out() {
                    return Err(DaqError::Timeout);
                }
            }
        }
        if !self.trigger.wait_until(deadline) {
            return Err(DaqError::Timeout);
        }

        let mut state = self.state.lock();
        if !state.inputs_running {
            return Err(DaqError::Timeout);
        }
        if let Some(limit) = self.options.fault_after_chunks {
            if state.chunks >= limit {
                warn!(area = self.area, chunks = state.chunks, "Injecting hardware fault");
                return Err(DaqError::HardwareFault(format!(
                    "simulated input overrun on area {} after {} chunks",
                    self.area, state.chunks
                )));
            }
        }
        let (spec, clock) = match (state.inputs, state.clock) {
            (Some(spec), Some(clock)) => (spec, clock),
            _ => return Err(DaqError::HardwareFault("inputs not configured".into())),
        };
        let cycle = state.x.len().max(1);
        let start = state.cursor;
        let channels = (0..spec.channels)
            .map(|channel| {
                (0..spec.chunk_samples as u64)
                    .map(|k| {
                        let idx = ((start + k) % cycle as u64) as usize;
                        let x = state.x.get(idx).copied().unwrap_or(0.0);
                        let y = state.y.get(idx).copied().unwrap_or(0.0);
                        self.detector_value(x, y, channel)
                    })
                    .collect()
            })
            .collect();
        state.cursor += spec.chunk_samples as u64;
        state.chunks += 1;
        let triggered_at = *state.triggered_at.get_or_insert_with(Instant::now);
        let produced = state.cursor;
        drop(state);

        if self.options.pace {
            let due = triggered_at + Duration::from_secs_f64(produced as f64 / clock.sample_rate_hz);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        Ok(SampleBlock { channels })
    }
}
