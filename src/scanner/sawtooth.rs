//! Unidirectional raster: every line ramps left to right, then flies back.

use crate::error::AppResult;
use crate::geometry::{GeometrySnapshot, ScanMode};
use crate::timing::{DeviceTiming, PixelTiming};

use super::{checked_samples, fraction_of, render, FrameLayout, Lead, SampleSequences};

/// Sawtooth pattern.
///
/// Line = `cutoff` lead-in (ramp, not imaged) + imaging + `retrace` flyback,
/// rounded up to the device line granularity. With no cutoff this is
/// `round(samples_per_pixel × width × (1 + retrace))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sawtooth;

impl Sawtooth {
    /// Single-plane layout.
    pub fn layout(
        &self,
        snapshot: &GeometrySnapshot,
        timing: &DeviceTiming,
        pixel: &PixelTiming,
    ) -> AppResult<FrameLayout> {
        raster_layout(ScanMode::Sawtooth, 1, snapshot, timing, pixel)
    }

    /// Ramp X across the field, step Y during flyback.
    pub fn generate(
        &self,
        layout: &FrameLayout,
        snapshot: &GeometrySnapshot,
        timing: &DeviceTiming,
    ) -> SampleSequences {
        render(layout, snapshot, timing, Lead::Ramp, |_| (-1.0, 1.0), |_| 0.0)
    }
}

/// Layout shared by the unidirectional patterns.
pub(crate) fn raster_layout(
    mode: ScanMode,
    planes: u32,
    snapshot: &GeometrySnapshot,
    timing: &DeviceTiming,
    pixel: &PixelTiming,
) -> AppResult<FrameLayout> {
    let imaging = checked_samples(
        pixel.samples_per_pixel as usize,
        snapshot.resolution_x as usize,
        "line",
    )?;
    let lead = fraction_of(imaging, snapshot.cutoff_fraction);
    let retrace = fraction_of(imaging, snapshot.retrace_fraction);
    let line = timing.coerce_line_samples(lead + imaging + retrace);
    checked_samples(line, snapshot.resolution_y as usize * planes as usize, "cycle")?;

    Ok(FrameLayout {
        mode,
        width: snapshot.resolution_x,
        height: snapshot.resolution_y,
        planes,
        samples_per_pixel: pixel.samples_per_pixel,
        lead_samples: lead,
        imaging_samples: imaging,
        line_samples: line,
        mirror_odd_lines: false,
        sample_rate_hz: timing.sample_rate_hz,
    })
}
