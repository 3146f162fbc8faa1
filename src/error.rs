//! Custom error types for the scan pipeline.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur anywhere between a GUI parameter edit and a frame
//! landing in storage.
//!
//! ## Error Hierarchy
//!
//! `DaqError` groups its variants by the layer that raises them:
//!
//! - **Parameter layer**: `OutOfRange`, `ReadOnly`, `Reentrant`. Raised synchronously by
//!   [`Value::set`](crate::parameter::Value::set) and returned to whoever requested the change.
//!   Values are never silently clamped.
//! - **Waveform layer**: `UnsupportedGeometry`, `CoercionFailed`. Raised by scanner-vector
//!   builds, always before any hardware call.
//! - **Queue layer**: `Timeout`, `Closed`. `Closed` is the normal end-of-stream signal for a
//!   draining consumer, not a failure.
//! - **Pipeline/device layer**: `TriggerTimeout`, `StartFailed`, `HardwareFault`, and the
//!   consolidated `Aborted` error that names the failing area and stage.
//! - **Configuration**: `Config`, `Configuration`, `Serialize`, `Io`.

use std::time::Duration;

use thiserror::Error;

use crate::controller::StageKind;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the scan pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A bounded parameter was set outside its `[min, max]` interval.
    #[error("Parameter '{name}' value {value} outside [{min}, {max}]")]
    OutOfRange {
        /// Parameter name
        name: String,
        /// Rejected value (debug-formatted)
        value: String,
        /// Lower bound (debug-formatted)
        min: String,
        /// Upper bound (debug-formatted)
        max: String,
    },

    /// Attempted to modify a read-only parameter.
    ///
    /// The orchestrator marks geometry fields read-only while an acquisition
    /// is running; GUI code should check `is_read_only()` before offering edits.
    #[error("Parameter '{name}' is read-only")]
    ReadOnly {
        /// Parameter name
        name: String,
    },

    /// A subscriber tried to `set` the parameter that is currently notifying it.
    #[error("Reentrant set on parameter '{name}' from inside its own notification")]
    Reentrant {
        /// Parameter name
        name: String,
    },

    /// The requested scan cannot be produced by the device.
    ///
    /// Raised when the coerced sample count exceeds the device buffer or the
    /// waveform leaves the output range.
    #[error("Unsupported scan geometry: {0}")]
    UnsupportedGeometry(String),

    /// A coerced timing value could not be written back into the geometry.
    #[error("Timing coercion failed: {0}")]
    CoercionFailed(String),

    /// A blocking queue or hardware read did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The queue was closed and holds no more data.
    #[error("Queue closed")]
    Closed,

    /// No trigger arrived within the configured trigger timeout.
    #[error("Area {area}: no trigger within {waited:?}")]
    TriggerTimeout {
        /// Area that was waiting
        area: usize,
        /// How long it waited
        waited: Duration,
    },

    /// A stage controller did not reach `Running`.
    #[error("Area {area} {stage} stage failed to start: {reason}")]
    StartFailed {
        /// Area of the failing controller
        area: usize,
        /// Stage of the failing controller
        stage: StageKind,
        /// Human-readable cause
        reason: String,
    },

    /// The hardware backend reported a fault.
    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    /// An acquisition was aborted; identifies the area and stage that failed first.
    #[error("Acquisition aborted by area {area} {stage} stage: {source}")]
    Aborted {
        /// Area of the failing controller
        area: usize,
        /// Stage of the failing controller
        stage: StageKind,
        /// Underlying failure
        #[source]
        source: Box<DaqError>,
    },

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Serializing a parameter tree failed.
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// True for the queue end-of-stream signal, which consumers treat as normal shutdown.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, DaqError::Closed)
    }

    /// Wrap this error as the consolidated abort error for `area`/`stage`.
    ///
    /// Already-consolidated errors are returned unchanged so the first failure wins.
    pub fn into_aborted(self, area: usize, stage: StageKind) -> DaqError {
        match self {
            aborted @ DaqError::Aborted { .. } => aborted,
            other => DaqError::Aborted {
                area,
                stage,
                source: Box::new(other),
            },
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<toml::ser::Error> for DaqError {
    fn from(value: toml::ser::Error) -> Self {
        DaqError::Serialize(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::ReadOnly {
            name: "zoom".to_string(),
        };
        assert_eq!(err.to_string(), "Parameter 'zoom' is read-only");
    }

    #[test]
    fn test_aborted_names_area_and_stage() {
        let err = DaqError::HardwareFault("AO underrun".into()).into_aborted(1, StageKind::Daq);
        let msg = err.to_string();
        assert!(msg.contains("area 1"));
        assert!(msg.contains("daq"));
        assert!(msg.contains("AO underrun"));
    }

    #[test]
    fn test_first_abort_wins() {
        let first = DaqError::Timeout.into_aborted(0, StageKind::Storage);
        let wrapped = first.into_aborted(3, StageKind::Pipeline);
        match wrapped {
            DaqError::Aborted { area, stage, .. } => {
                assert_eq!(area, 0);
                assert_eq!(stage, StageKind::Storage);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_closed_is_end_of_stream() {
        assert!(DaqError::Closed.is_end_of_stream());
        assert!(!DaqError::Timeout.is_end_of_stream());
    }
}
