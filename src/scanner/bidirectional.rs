//! Bidirectional raster: even lines left to right, odd lines right to left.

use crate::error::AppResult;
use crate::geometry::{GeometrySnapshot, ScanMode};
use crate::timing::{DeviceTiming, PixelTiming};

use super::{checked_samples, fraction_of, render, FrameLayout, Lead, SampleSequences};

/// Bidirectional pattern.
///
/// Each line carries a turnaround of `turning_fraction × imaging` samples at
/// both ends, during which the fast axis holds at the field edge for galvo
/// settling. Line = `imaging + 2 × turn`, rounded up to the line granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bidirectional;

impl Bidirectional {
    /// Layout with mirrored odd lines.
    pub fn layout(
        &self,
        snapshot: &GeometrySnapshot,
        timing: &DeviceTiming,
        pixel: &PixelTiming,
    ) -> AppResult<FrameLayout> {
        let imaging = checked_samples(
            pixel.samples_per_pixel as usize,
            snapshot.resolution_x as usize,
            "line",
        )?;
        let turn = fraction_of(imaging, snapshot.turning_fraction);
        let line = timing.coerce_line_samples(imaging + 2 * turn);
        checked_samples(line, snapshot.resolution_y as usize, "frame")?;

        Ok(FrameLayout {
            mode: ScanMode::Bidirectional,
            width: snapshot.resolution_x,
            height: snapshot.resolution_y,
            planes: 1,
            samples_per_pixel: pixel.samples_per_pixel,
            lead_samples: turn,
            imaging_samples: imaging,
            line_samples: line,
            mirror_odd_lines: true,
            sample_rate_hz: timing.sample_rate_hz,
        })
    }

    /// Alternate X direction per line; Y steps during the turnaround.
    pub fn generate(
        &self,
        layout: &FrameLayout,
        snapshot: &GeometrySnapshot,
        timing: &DeviceTiming,
    ) -> SampleSequences {
        render(
            layout,
            snapshot,
            timing,
            Lead::Hold,
            |line| if line % 2 == 0 { (-1.0, 1.0) } else { (1.0, -1.0) },
            |_| 0.0,
        )
    }
}
