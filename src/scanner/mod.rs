//! Scanner vectors: scan-waveform generation and the sample ↔ pixel map.
//!
//! A [`ScannerVector`] turns a [`GeometrySnapshot`] into one hardware output
//! cycle of four aligned channels (X, Y, auxiliary, modulation) plus the
//! [`FrameLayout`] the pipeline stage uses to fold raw input samples back into
//! pixels.
//!
//! Every line has the same shape:
//!
//! ```text
//!  ┌──────┬────────────────────────────────┬─────────────────┐
//!  │ lead │ imaging (width × samples/px)   │ trail (+ pad)   │
//!  └──────┴────────────────────────────────┴─────────────────┘
//!   cutoff   pixels, modulation on           retrace / turn,
//!   / turn                                   Y (and aux) step
//! ```
//!
//! Only imaging samples map to pixels. The variants differ in how they size
//! lead and trail, and in whether odd lines run backwards.
//!
//! Build order is fixed: snapshot, coerce pixel time, write the coerced value
//! back, lay out, check the device buffer, generate, check output range. All
//! of it happens before any hardware call, and a failed build leaves the
//! previous sequences in place.

pub mod bidirectional;
pub mod plane_hopper;
pub mod sawtooth;

use std::f64::consts::PI;
use std::ops::Range;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::geometry::{GeometrySnapshot, ScanGeometry, ScanMode};
use crate::timing::{DeviceTiming, PixelTiming};

pub use bidirectional::Bidirectional;
pub use plane_hopper::PlaneHopper;
pub use sawtooth::Sawtooth;

/// Position of one pixel within a scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelCoord {
    /// Column
    pub x: u32,
    /// Row
    pub y: u32,
    /// Focal plane (0 unless plane hopping)
    pub plane: u32,
}

impl PixelCoord {
    /// Pixel in plane 0.
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y, plane: 0 }
    }
}

/// Output sample sequences for one hardware cycle, one entry per sample clock tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleSequences {
    /// Fast scan axis, volts
    pub x: Vec<f64>,
    /// Slow scan axis, volts
    pub y: Vec<f64>,
    /// Auxiliary (focus) axis, volts
    pub aux: Vec<f64>,
    /// Light modulation, volts
    pub modulation: Vec<f64>,
}

impl SampleSequences {
    fn with_capacity(samples: usize) -> Self {
        Self {
            x: Vec::with_capacity(samples),
            y: Vec::with_capacity(samples),
            aux: Vec::with_capacity(samples),
            modulation: Vec::with_capacity(samples),
        }
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// True if no samples have been generated.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Channels in hardware order: X, Y, aux, modulation.
    pub fn channels(&self) -> [&[f64]; 4] {
        [&self.x, &self.y, &self.aux, &self.modulation]
    }
}

/// Sample-level shape of one scan cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameLayout {
    /// Pattern that produced this layout
    pub mode: ScanMode,
    /// Pixels per line
    pub width: u32,
    /// Lines per frame
    pub height: u32,
    /// Frames (focal planes) per cycle
    pub planes: u32,
    /// Samples integrated into each pixel
    pub samples_per_pixel: u32,
    /// Samples before the first pixel of each line
    pub lead_samples: usize,
    /// Samples that map to pixels in each line
    pub imaging_samples: usize,
    /// Total samples per line after granularity rounding
    pub line_samples: usize,
    /// Odd lines run right to left
    pub mirror_odd_lines: bool,
    /// Sample clock the layout was computed for
    pub sample_rate_hz: f64,
}

impl FrameLayout {
    /// Samples after the last pixel of each line (retrace or turnaround, plus padding).
    pub fn trail_samples(&self) -> usize {
        self.line_samples - self.lead_samples - self.imaging_samples
    }

    /// Samples in one frame.
    pub fn frame_samples(&self) -> usize {
        self.line_samples * self.height as usize
    }

    /// Samples in one output cycle (all planes).
    pub fn cycle_samples(&self) -> usize {
        self.frame_samples() * self.planes as usize
    }

    /// Pixels in one frame.
    pub fn pixels_per_frame(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Time to scan one line.
    pub fn line_duration(&self) -> Duration {
        Duration::from_secs_f64(self.line_samples as f64 / self.sample_rate_hz)
    }

    /// Time to scan one frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_samples() as f64 / self.sample_rate_hz)
    }

    /// Time for one full output cycle.
    pub fn cycle_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_samples() as f64 / self.sample_rate_hz)
    }

    /// Pixel a sample index contributes to, or `None` for lead/trail samples.
    pub fn sample_to_pixel(&self, sample: usize) -> Option<PixelCoord> {
        if sample >= self.cycle_samples() {
            return None;
        }
        let frame = self.frame_samples();
        let plane = sample / frame;
        let within = sample % frame;
        let line = within / self.line_samples;
        let pos = within % self.line_samples;
        if pos < self.lead_samples || pos >= self.lead_samples + self.imaging_samples {
            return None;
        }
        let column = ((pos - self.lead_samples) / self.samples_per_pixel as usize) as u32;
        let x = if self.is_mirrored(line) {
            self.width - 1 - column
        } else {
            column
        };
        Some(PixelCoord {
            x,
            y: line as u32,
            plane: plane as u32,
        })
    }

    /// Samples that make up one pixel, or `None` if the coordinate is outside the cycle.
    pub fn pixel_to_sample_range(&self, pixel: PixelCoord) -> Option<Range<usize>> {
        if pixel.x >= self.width || pixel.y >= self.height || pixel.plane >= self.planes {
            return None;
        }
        let line = pixel.y as usize;
        let column = if self.is_mirrored(line) {
            self.width - 1 - pixel.x
        } else {
            pixel.x
        } as usize;
        let spp = self.samples_per_pixel as usize;
        let start = pixel.plane as usize * self.frame_samples()
            + line * self.line_samples
            + self.lead_samples
            + column * spp;
        Some(start..start + spp)
    }

    fn is_mirrored(&self, line: usize) -> bool {
        self.mirror_odd_lines && line % 2 == 1
    }
}

/// Closed set of scan patterns.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Unidirectional ramp with flyback
    Sawtooth(Sawtooth),
    /// Alternating line direction
    Bidirectional(Bidirectional),
    /// Sawtooth frames stepped through focal planes
    PlaneHopper(PlaneHopper),
}

impl Pattern {
    /// Pattern for a scan mode.
    pub fn for_mode(mode: ScanMode) -> Self {
        match mode {
            ScanMode::Sawtooth => Pattern::Sawtooth(Sawtooth),
            ScanMode::Bidirectional => Pattern::Bidirectional(Bidirectional),
            ScanMode::PlaneHopper => Pattern::PlaneHopper(PlaneHopper),
        }
    }

    /// Scan mode this pattern implements.
    pub fn mode(&self) -> ScanMode {
        match self {
            Pattern::Sawtooth(_) => ScanMode::Sawtooth,
            Pattern::Bidirectional(_) => ScanMode::Bidirectional,
            Pattern::PlaneHopper(_) => ScanMode::PlaneHopper,
        }
    }

    /// Sample layout for a snapshot at a coerced pixel timing.
    pub fn layout(
        &self,
        snapshot: &GeometrySnapshot,
        timing: &DeviceTiming,
        pixel: &PixelTiming,
    ) -> AppResult<FrameLayout> {
        match self {
            Pattern::Sawtooth(p) => p.layout(snapshot, timing, pixel),
            Pattern::Bidirectional(p) => p.layout(snapshot, timing, pixel),
            Pattern::PlaneHopper(p) => p.layout(snapshot, timing, pixel),
        }
    }

    /// Output sequences for a layout.
    pub fn generate(
        &self,
        layout: &FrameLayout,
        snapshot: &GeometrySnapshot,
        timing: &DeviceTiming,
    ) -> SampleSequences {
        match self {
            Pattern::Sawtooth(p) => p.generate(layout, snapshot, timing),
            Pattern::Bidirectional(p) => p.generate(layout, snapshot, timing),
            Pattern::PlaneHopper(p) => p.generate(layout, snapshot, timing),
        }
    }
}

#[derive(Debug, Clone)]
struct BuiltScan {
    snapshot: GeometrySnapshot,
    pixel: PixelTiming,
    layout: FrameLayout,
    sequences: SampleSequences,
}

/// Stateful waveform generator for one area.
///
/// Owned exclusively by the Daq stage while its sequences are being output.
#[derive(Debug, Clone)]
pub struct ScannerVector {
    area: usize,
    pattern: Pattern,
    built: Option<BuiltScan>,
}

impl ScannerVector {
    /// Unbuilt vector for `mode`.
    pub fn new(area: usize, mode: ScanMode) -> Self {
        Self {
            area,
            pattern: Pattern::for_mode(mode),
            built: None,
        }
    }

    /// Area this vector drives.
    pub fn area(&self) -> usize {
        self.area
    }

    /// Active pattern.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Rebuild from the current geometry, replacing any previous sequences.
    ///
    /// A coerced pixel time is written back into `geometry` (and its active
    /// preset) once the sequences have passed every check; a failed build
    /// leaves the geometry untouched.
    ///
    /// # Errors
    ///
    /// - [`DaqError::CoercionFailed`] if the pixel time cannot be quantised or stored
    /// - [`DaqError::UnsupportedGeometry`] if the cycle exceeds the device buffer or
    ///   any sample leaves the output range
    pub fn build(
        &mut self,
        geometry: &ScanGeometry,
        timing: &DeviceTiming,
    ) -> AppResult<&SampleSequences> {
        let mut snapshot = geometry.snapshot();
        if snapshot.mode != self.pattern.mode() {
            info!(
                area = self.area,
                from = %self.pattern.mode(),
                to = %snapshot.mode,
                "Scan mode changed, switching pattern"
            );
            self.pattern = Pattern::for_mode(snapshot.mode);
        }

        let pixel = timing.coerce_pixel_time(snapshot.pixel_time_us)?;
        snapshot.pixel_time_us = pixel.pixel_time_us;

        let layout = self.pattern.layout(&snapshot, timing, &pixel)?;
        timing.check_buffer(layout.cycle_samples())?;

        let sequences = self.pattern.generate(&layout, &snapshot, timing);
        check_output_range(&sequences, timing)?;

        if pixel.coerced {
            geometry.write_back_pixel_time(pixel.pixel_time_us, snapshot.preset.as_deref())?;
        }

        info!(
            area = self.area,
            mode = %layout.mode,
            width = layout.width,
            height = layout.height,
            planes = layout.planes,
            samples_per_pixel = layout.samples_per_pixel,
            line_samples = layout.line_samples,
            cycle_samples = layout.cycle_samples(),
            "Scanner vector built"
        );

        let built = self.built.insert(BuiltScan {
            snapshot,
            pixel,
            layout,
            sequences,
        });
        Ok(&built.sequences)
    }

    /// True after a successful build.
    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    /// Geometry the current sequences were built from.
    pub fn snapshot(&self) -> Option<&GeometrySnapshot> {
        self.built.as_ref().map(|b| &b.snapshot)
    }

    /// Coerced pixel timing of the current build.
    pub fn pixel_timing(&self) -> Option<PixelTiming> {
        self.built.as_ref().map(|b| b.pixel)
    }

    /// Layout of the current build.
    pub fn layout(&self) -> Option<&FrameLayout> {
        self.built.as_ref().map(|b| &b.layout)
    }

    /// Output sequences of the current build.
    pub fn sequences(&self) -> Option<&SampleSequences> {
        self.built.as_ref().map(|b| &b.sequences)
    }

    /// See [`FrameLayout::pixel_to_sample_range`].
    pub fn pixel_to_sample_range(&self, pixel: PixelCoord) -> Option<Range<usize>> {
        self.layout()?.pixel_to_sample_range(pixel)
    }

    /// See [`FrameLayout::sample_to_pixel`].
    pub fn sample_to_pixel(&self, sample: usize) -> Option<PixelCoord> {
        self.layout()?.sample_to_pixel(sample)
    }
}

/// Reject samples outside the device output range.
fn check_output_range(seq: &SampleSequences, timing: &DeviceTiming) -> AppResult<()> {
    let tolerance = 1e-9;
    let axis_limit = timing.scan_range_volts + tolerance;
    for (axis, samples) in [("x", &seq.x), ("y", &seq.y)] {
        if let Some(v) = samples.iter().find(|v| v.abs() > axis_limit) {
            return Err(DaqError::UnsupportedGeometry(format!(
                "{} output reaches {:.3} V, beyond ±{} V; increase zoom or recentre",
                axis, v, timing.scan_range_volts
            )));
        }
    }
    let aux_limit = timing.aux_range_volts + tolerance;
    if let Some(v) = seq.aux.iter().find(|v| v.abs() > aux_limit) {
        return Err(DaqError::UnsupportedGeometry(format!(
            "aux output reaches {:.3} V, beyond ±{} V",
            v, timing.aux_range_volts
        )));
    }
    Ok(())
}

/// Multiply sample counts, failing on overflow.
pub(crate) fn checked_samples(a: usize, b: usize, what: &str) -> AppResult<usize> {
    a.checked_mul(b).ok_or_else(|| {
        DaqError::UnsupportedGeometry(format!("{} sample count overflows", what))
    })
}

/// `round(base × fraction)` as a sample count.
pub(crate) fn fraction_of(base: usize, fraction: f64) -> usize {
    (base as f64 * fraction).round() as usize
}

/// Maps normalised field coordinates `(u, v) ∈ [-1, 1]²` to output volts.
///
/// Zoom shrinks the field, offsets move its centre, rotation turns it about
/// the centre. Non-square resolutions keep square pixels.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldTransform {
    half_width: f64,
    half_height: f64,
    centre_x: f64,
    centre_y: f64,
    cos: f64,
    sin: f64,
}

impl FieldTransform {
    pub(crate) fn new(snapshot: &GeometrySnapshot, timing: &DeviceTiming) -> Self {
        let range = timing.scan_range_volts;
        let half_width = range / snapshot.zoom;
        let half_height =
            half_width * f64::from(snapshot.resolution_y) / f64::from(snapshot.resolution_x);
        let theta = snapshot.rotation_deg.to_radians();
        Self {
            half_width,
            half_height,
            centre_x: (snapshot.offset_x - 0.5) * 2.0 * range,
            centre_y: (snapshot.offset_y - 0.5) * 2.0 * range,
            cos: theta.cos(),
            sin: theta.sin(),
        }
    }

    pub(crate) fn apply(&self, u: f64, v: f64) -> (f64, f64) {
        let x = u * self.half_width;
        let y = v * self.half_height;
        (
            self.centre_x + x * self.cos - y * self.sin,
            self.centre_y + x * self.sin + y * self.cos,
        )
    }
}

/// How the lead-in segment of a line moves the fast axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lead {
    /// Continue the imaging ramp backwards (galvo acceleration)
    Ramp,
    /// Hold at the line's starting edge (turnaround settling)
    Hold,
}

/// Renders a cycle line by line in normalised coordinates.
///
/// `line_edges(line)` gives the fast-axis start and end of the imaged span;
/// `plane_aux(plane)` the auxiliary level held while a plane is scanned.
/// During each trail the axes ease (raised cosine) towards the first sample
/// of the next line, wrapping to the start of the cycle after the last one.
pub(crate) fn render(
    layout: &FrameLayout,
    snapshot: &GeometrySnapshot,
    timing: &DeviceTiming,
    lead: Lead,
    line_edges: impl Fn(u32) -> (f64, f64),
    plane_aux: impl Fn(u32) -> f64,
) -> SampleSequences {
    let transform = FieldTransform::new(snapshot, timing);
    let imaging = layout.imaging_samples;
    let lead_n = layout.lead_samples;
    let trail_n = layout.trail_samples();
    let on = timing.modulation_on_volts;

    let fast = |line: u32, i: isize| -> f64 {
        let (start, end) = line_edges(line);
        let slope = (end - start) / imaging as f64;
        start + slope * (i as f64 + 0.5)
    };
    let slow = |line: u32| -> f64 { -1.0 + 2.0 * (f64::from(line) + 0.5) / f64::from(layout.height) };
    let first_fast = |line: u32| -> f64 {
        match lead {
            Lead::Ramp => fast(line, -(lead_n as isize)),
            Lead::Hold if lead_n > 0 => line_edges(line).0,
            Lead::Hold => fast(line, 0),
        }
    };

    let mut seq = SampleSequences::with_capacity(layout.cycle_samples());
    let mut push = |u: f64, v: f64, aux: f64, modulation: f64| {
        let (x, y) = transform.apply(u, v);
        seq.x.push(x);
        seq.y.push(y);
        seq.aux.push(aux);
        seq.modulation.push(modulation);
    };

    for plane in 0..layout.planes {
        let aux = plane_aux(plane);
        for line in 0..layout.height {
            let v = slow(line);

            for j in 0..lead_n {
                let u = match lead {
                    Lead::Ramp => fast(line, j as isize - lead_n as isize),
                    Lead::Hold => line_edges(line).0,
                };
                push(u, v, aux, 0.0);
            }

            for i in 0..imaging {
                push(fast(line, i as isize), v, aux, on);
            }

            let last_line = line + 1 == layout.height;
            let (next_line, next_plane) = match (last_line, plane + 1 == layout.planes) {
                (false, _) => (line + 1, plane),
                (true, false) => (0, plane + 1),
                (true, true) => (0, 0),
            };
            let from_u = fast(line, imaging as isize - 1);
            let to_u = first_fast(next_line);
            let to_v = slow(next_line);
            let to_aux = if last_line { plane_aux(next_plane) } else { aux };
            for k in 0..trail_n {
                let s = ease((k + 1) as f64 / (trail_n + 1) as f64);
                push(
                    from_u + (to_u - from_u) * s,
                    v + (to_v - v) * s,
                    aux + (to_aux - aux) * s,
                    0.0,
                );
            }
        }
    }

    debug!(samples = seq.len(), "Rendered scan cycle");
    seq
}

/// Raised-cosine easing on `[0, 1]`.
fn ease(t: f64) -> f64 {
    (1.0 - (PI * t).cos()) / 2.0
}
