//! Device timing constants and pixel-time coercion.
//!
//! Every scanner vector is quantised to the output/input sample clock:
//!
//! ```text
//!   pixel   ┌──┬──┬──┬──┬──┬──┐
//!           │s0│s1│s2│s3│s4│s5│   samples_per_pixel = ceil(pixel_time / sample_period)
//!           └──┴──┴──┴──┴──┴──┘
//!   line    [ lead │ resolution_x × samples_per_pixel │ trail ]  rounded up to line_granularity
//! ```
//!
//! A requested pixel time that is not an exact multiple of the sample period,
//! or is below the device minimum, is coerced **up**; the caller writes the
//! coerced value back so GUI, persisted config and hardware agree.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};

/// Tolerance used when deciding whether a pixel time already sits on the sample grid.
const GRID_EPSILON: f64 = 1e-9;

/// Timing capabilities of one output/input device pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTiming {
    /// Shared output/input sample clock in Hz
    pub sample_rate_hz: f64,
    /// Smallest number of samples that may form one pixel
    pub min_samples_per_pixel: u32,
    /// Line sample counts are rounded up to a multiple of this
    pub line_granularity: usize,
    /// Largest output buffer (samples per channel) the device accepts
    pub max_buffer_samples: usize,
    /// Scan axes span `[-scan_range_volts, +scan_range_volts]` at zoom 1
    pub scan_range_volts: f64,
    /// Auxiliary (focus) axis output limit, symmetric
    pub aux_range_volts: f64,
    /// Modulation output level while pixels are being imaged
    pub modulation_on_volts: f64,
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1_000_000.0,
            min_samples_per_pixel: 1,
            line_granularity: 2,
            max_buffer_samples: 16 * 1024 * 1024,
            scan_range_volts: 5.0,
            aux_range_volts: 10.0,
            modulation_on_volts: 2.0,
        }
    }
}

/// Result of quantising a requested pixel time to the sample clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelTiming {
    /// Whole samples per pixel
    pub samples_per_pixel: u32,
    /// Pixel time actually produced, in microseconds
    pub pixel_time_us: f64,
    /// True when `pixel_time_us` differs from the request
    pub coerced: bool,
}

impl DeviceTiming {
    /// Sample period in microseconds.
    pub fn sample_period_us(&self) -> f64 {
        1e6 / self.sample_rate_hz
    }

    /// Shortest pixel time the device can produce, in microseconds.
    pub fn min_pixel_time_us(&self) -> f64 {
        f64::from(self.min_samples_per_pixel) * self.sample_period_us()
    }

    /// Wall-clock duration of `samples` sample periods.
    pub fn duration_of(&self, samples: usize) -> Duration {
        Duration::from_secs_f64(samples as f64 / self.sample_rate_hz)
    }

    /// Check the timing constants themselves.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(DaqError::Configuration(format!(
                "sample_rate_hz must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if self.min_samples_per_pixel == 0 {
            return Err(DaqError::Configuration(
                "min_samples_per_pixel must be at least 1".into(),
            ));
        }
        if self.line_granularity == 0 {
            return Err(DaqError::Configuration(
                "line_granularity must be at least 1".into(),
            ));
        }
        if self.max_buffer_samples == 0 {
            return Err(DaqError::Configuration(
                "max_buffer_samples must be positive".into(),
            ));
        }
        if self.scan_range_volts <= 0.0 || self.aux_range_volts <= 0.0 {
            return Err(DaqError::Configuration(
                "output ranges must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Quantise a requested pixel time onto the sample grid.
    ///
    /// The larger of the requested time and the device minimum wins, and the
    /// result is always a whole number of sample periods.
    pub fn coerce_pixel_time(&self, requested_us: f64) -> AppResult<PixelTiming> {
        if !(requested_us.is_finite() && requested_us > 0.0) {
            return Err(DaqError::CoercionFailed(format!(
                "pixel time {} µs is not a positive number",
                requested_us
            )));
        }

        let period = self.sample_period_us();
        let exact = requested_us / period;
        let mut samples = (exact - GRID_EPSILON).ceil().max(1.0);
        if samples > f64::from(u32::MAX) {
            return Err(DaqError::CoercionFailed(format!(
                "pixel time {} µs needs more than {} samples",
                requested_us,
                u32::MAX
            )));
        }
        samples = samples.max(f64::from(self.min_samples_per_pixel));

        let samples_per_pixel = samples as u32;
        let pixel_time_us = f64::from(samples_per_pixel) * period;
        let coerced = (pixel_time_us - requested_us).abs() > GRID_EPSILON * period.max(1.0);

        if coerced {
            warn!(
                requested_us,
                actual_us = pixel_time_us,
                min_us = self.min_pixel_time_us(),
                "Pixel time coerced to sample clock"
            );
        } else {
            debug!(pixel_time_us, samples_per_pixel, "Pixel time on sample grid");
        }

        Ok(PixelTiming {
            samples_per_pixel,
            pixel_time_us,
            coerced,
        })
    }

    /// Round a raw line sample count up to the device granularity.
    pub fn coerce_line_samples(&self, raw: usize) -> usize {
        let g = self.line_granularity.max(1);
        raw.div_ceil(g) * g
    }

    /// Fail with `UnsupportedGeometry` if a cycle does not fit the device buffer.
    pub fn check_buffer(&self, cycle_samples: usize) -> AppResult<()> {
        if cycle_samples > self.max_buffer_samples {
            return Err(DaqError::UnsupportedGeometry(format!(
                "{} samples per output cycle exceed the device buffer of {}",
                cycle_samples, self.max_buffer_samples
            )));
        }
        Ok(())
    }
}
