//! Multi-plane raster: a sawtooth frame per focal plane, stepping the aux axis in between.

use crate::error::AppResult;
use crate::geometry::{GeometrySnapshot, ScanMode};
use crate::timing::{DeviceTiming, PixelTiming};

use super::sawtooth::raster_layout;
use super::{render, FrameLayout, Lead, SampleSequences};

/// Plane-hopping pattern.
///
/// The output cycle is `planes` sawtooth frames back to back. Plane `p` holds
/// the auxiliary axis at `p × plane_step_volts`; the hop to the next plane
/// happens during the flyback of each frame's last line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneHopper;

impl PlaneHopper {
    /// Sawtooth layout replicated over `snapshot.planes`.
    pub fn layout(
        &self,
        snapshot: &GeometrySnapshot,
        timing: &DeviceTiming,
        pixel: &PixelTiming,
    ) -> AppResult<FrameLayout> {
        raster_layout(
            ScanMode::PlaneHopper,
            snapshot.planes.max(1),
            snapshot,
            timing,
            pixel,
        )
    }

    /// Sawtooth frames with a per-plane auxiliary offset.
    pub fn generate(
        &self,
        layout: &FrameLayout,
        snapshot: &GeometrySnapshot,
        timing: &DeviceTiming,
    ) -> SampleSequences {
        let step = snapshot.plane_step_volts;
        render(
            layout,
            snapshot,
            timing,
            Lead::Ramp,
            |_| (-1.0, 1.0),
            |plane| f64::from(plane) * step,
        )
    }
}
