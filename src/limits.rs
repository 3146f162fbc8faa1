//! Shared hard limits and default timeouts.
//!
//! This module centralizes:
//! - Timeouts used by the start rendezvous, queue polling and fault reporting
//! - Size limits that keep a bad config from allocating without bound

use std::time::Duration;

use crate::error::{AppResult, DaqError};

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default bound on a stage controller reaching `Running` (5 seconds).
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval at which blocked workers recheck cancellation (10 ms).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a failing stage waits to hand its fault to the supervisor (1 second).
pub const FAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Size Limits
// =============================================================================

/// Largest supported image width or height in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 8192;
/// Maximum number of synchronized areas.
pub const MAX_AREAS: usize = 16;
/// Maximum detector channels per area.
pub const MAX_INPUT_CHANNELS: usize = 32;
/// Maximum samples per channel in one Daq chunk.
pub const MAX_CHUNK_SAMPLES: usize = 16 * 1024 * 1024;
/// Maximum capacity of any pipeline queue.
pub const MAX_QUEUE_CAPACITY: usize = 4096;

/// Validate the shape of an input chunk.
pub fn validate_chunk_shape(channels: usize, chunk_samples: usize) -> AppResult<()> {
    if channels == 0 || channels > MAX_INPUT_CHANNELS {
        return Err(DaqError::Configuration(format!(
            "input_channels must be in 1..={}, got {}",
            MAX_INPUT_CHANNELS, channels
        )));
    }
    if chunk_samples == 0 || chunk_samples > MAX_CHUNK_SAMPLES {
        return Err(DaqError::Configuration(format!(
            "chunk_samples must be in 1..={}, got {}",
            MAX_CHUNK_SAMPLES, chunk_samples
        )));
    }
    Ok(())
}

/// Validate a queue capacity.
pub fn validate_queue_capacity(name: &str, capacity: usize) -> AppResult<()> {
    if capacity == 0 || capacity > MAX_QUEUE_CAPACITY {
        return Err(DaqError::Configuration(format!(
            "{} must be in 1..={}, got {}",
            name, MAX_QUEUE_CAPACITY, capacity
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_shape() {
        assert!(validate_chunk_shape(2, 4096).is_ok());
        assert!(validate_chunk_shape(0, 4096).is_err());
        assert!(validate_chunk_shape(2, 0).is_err());
        assert!(validate_chunk_shape(MAX_INPUT_CHANNELS + 1, 1).is_err());
    }

    #[test]
    fn test_queue_capacity() {
        assert!(validate_queue_capacity("daq_queue_capacity", 1).is_ok());
        assert!(validate_queue_capacity("daq_queue_capacity", 0).is_err());
    }
}
