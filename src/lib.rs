//! # Scan DAQ Core Library
//!
//! Multi-area laser-scanning acquisition: scan waveform generation, a
//! threaded acquire → assemble → store/display pipeline per area, and the
//! reactive parameters a GUI edits while scans are prepared.
//!
//! ## Crate Structure
//!
//! - **`parameter`**: `Value<T>`, a bounded, observable, optionally read-only parameter.
//! - **`geometry`**: `ScanGeometry`, the per-area set of scan parameters, with presets and
//!   consistent snapshots.
//! - **`timing`**: `DeviceTiming`, the sample clock and buffer limits, and pixel-time coercion.
//! - **`scanner`**: `ScannerVector` and its scan patterns (sawtooth, bidirectional,
//!   plane hopper) turning a geometry snapshot into output samples and a pixel map.
//! - **`data`**: `DaqChunk`, `AssembledImage` and per-run `ScanMetadata`.
//! - **`queue`**: `SyncQueue<T>`, the bounded blocking queue between stages.
//! - **`hardware`**: the `HardwareBackend` contract and a simulated backend.
//! - **`sink`**: display and storage consumers.
//! - **`controller`**: `StageController` lifecycle and the daq, pipeline, display and storage workers.
//! - **`orchestrator`**: multi-area wiring, synchronized start and fault supervision.
//! - **`config`**: figment-loaded `AppConfig` and the persisted `ParameterTree`.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `DaqError` taxonomy.

pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod geometry;
pub mod hardware;
pub mod limits;
pub mod logging;
pub mod orchestrator;
pub mod parameter;
pub mod queue;
pub mod scanner;
pub mod sink;
pub mod timing;

pub use error::{AppResult, DaqError};
pub use geometry::{GeometrySnapshot, ScanGeometry, ScanMode};
pub use orchestrator::{AreaSetup, Orchestrator};
pub use parameter::Value;
pub use scanner::ScannerVector;
