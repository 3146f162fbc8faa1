//! Scan geometry parameters for one area.
//!
//! [`ScanGeometry`] is an explicitly owned aggregate of [`Value`] fields that
//! the GUI edits, the config layer loads and saves, and the scanner vector
//! snapshots at build time. Each area owns its own instance; nothing here is
//! process-global.
//!
//! Multi-field edits (`apply_preset`, `apply_tree`, [`ScanGeometry::transaction`])
//! are serialised against [`ScanGeometry::snapshot`], so a snapshot never mixes
//! the halves of one edit.

use std::fmt;
use std::str::FromStr;

use parking_lot::{ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ParameterTree;
use crate::error::{AppResult, DaqError};
use crate::limits::MAX_IMAGE_DIMENSION;
use crate::parameter::Value;

/// Scan pattern family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Unidirectional ramp with flyback
    #[default]
    Sawtooth,
    /// Alternating line direction
    Bidirectional,
    /// Sawtooth frames stepped through focal planes on the auxiliary axis
    PlaneHopper,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanMode::Sawtooth => "sawtooth",
            ScanMode::Bidirectional => "bidirectional",
            ScanMode::PlaneHopper => "plane_hopper",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for ScanMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sawtooth" => Ok(ScanMode::Sawtooth),
            "bidirectional" | "bidi" => Ok(ScanMode::Bidirectional),
            "plane_hopper" | "planehopper" => Ok(ScanMode::PlaneHopper),
            other => Err(DaqError::Configuration(format!(
                "Unknown scan mode '{}'. Must be one of: sawtooth, bidirectional, plane_hopper",
                other
            ))),
        }
    }
}

/// Named override of the resolution, timing and retrace fields (Sawtooth).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    /// Preset name, unique within one geometry
    pub name: String,
    /// Pixels per line
    pub resolution_x: u32,
    /// Lines per frame
    pub resolution_y: u32,
    /// Pixel dwell time in microseconds
    pub pixel_time_us: f64,
    /// Flyback length as a fraction of the imaged line
    pub retrace_fraction: f64,
}

/// Plain copy of every geometry field, taken atomically.
///
/// Also the on-disk form of an area's geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometrySnapshot {
    /// Scan pattern family
    pub mode: ScanMode,
    /// Pixels per line
    pub resolution_x: u32,
    /// Lines per frame
    pub resolution_y: u32,
    /// Field magnification (1 = full device range)
    pub zoom: f64,
    /// Field centre along X as a fraction of the full range (0.5 = centred)
    pub offset_x: f64,
    /// Field centre along Y as a fraction of the full range (0.5 = centred)
    pub offset_y: f64,
    /// Scan rotation in degrees
    pub rotation_deg: f64,
    /// Pixel dwell time in microseconds
    pub pixel_time_us: f64,
    /// Sawtooth flyback as a fraction of the imaged line
    pub retrace_fraction: f64,
    /// Sawtooth lead-in discarded from the pixel map, fraction of the imaged line
    pub cutoff_fraction: f64,
    /// Bidirectional turnaround at each line end, fraction of the imaged line
    pub turning_fraction: f64,
    /// Number of focal planes (PlaneHopper)
    pub planes: u32,
    /// Auxiliary-axis step between planes in volts (PlaneHopper)
    pub plane_step_volts: f64,
    /// Preset the resolution/timing/retrace fields were taken from, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

impl Default for GeometrySnapshot {
    fn default() -> Self {
        Self {
            mode: ScanMode::Sawtooth,
            resolution_x: 256,
            resolution_y: 256,
            zoom: 1.0,
            offset_x: 0.5,
            offset_y: 0.5,
            rotation_deg: 0.0,
            pixel_time_us: 2.0,
            retrace_fraction: 0.1,
            cutoff_fraction: 0.0,
            turning_fraction: 0.1,
            planes: 1,
            plane_step_volts: 0.5,
            preset: None,
        }
    }
}

/// Reactive scan geometry of one area.
pub struct ScanGeometry {
    /// Scan pattern family
    pub mode: Value<ScanMode>,
    /// Pixels per line
    pub resolution_x: Value<u32>,
    /// Lines per frame
    pub resolution_y: Value<u32>,
    /// Field magnification
    pub zoom: Value<f64>,
    /// Field centre X fraction
    pub offset_x: Value<f64>,
    /// Field centre Y fraction
    pub offset_y: Value<f64>,
    /// Rotation in degrees
    pub rotation_deg: Value<f64>,
    /// Pixel dwell time
    pub pixel_time_us: Value<f64>,
    /// Sawtooth flyback fraction
    pub retrace_fraction: Value<f64>,
    /// Sawtooth lead-in fraction
    pub cutoff_fraction: Value<f64>,
    /// Bidirectional turnaround fraction
    pub turning_fraction: Value<f64>,
    /// Focal plane count
    pub planes: Value<u32>,
    /// Volts between focal planes
    pub plane_step_volts: Value<f64>,
    /// Name of the preset applied by Sawtooth builds (empty = none)
    pub active_preset: Value<String>,
    presets: RwLock<Vec<Preset>>,
    /// Held by snapshots and multi-field edits.
    edit: ReentrantMutex<()>,
}

impl fmt::Debug for ScanGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanGeometry")
            .field("snapshot", &self.snapshot())
            .field("presets", &self.presets.read().len())
            .finish()
    }
}

impl Default for ScanGeometry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanGeometry {
    /// Geometry with default values and validated bounds.
    pub fn new() -> Self {
        let d = GeometrySnapshot::default();
        Self {
            mode: Value::new("mode", d.mode),
            resolution_x: Value::new("resolution_x", d.resolution_x)
                .with_range(1, MAX_IMAGE_DIMENSION)
                .with_units("px"),
            resolution_y: Value::new("resolution_y", d.resolution_y)
                .with_range(1, MAX_IMAGE_DIMENSION)
                .with_units("px"),
            zoom: Value::new("zoom", d.zoom).with_range(1.0, 1000.0),
            offset_x: Value::new("offset_x", d.offset_x).with_range(0.0, 1.0),
            offset_y: Value::new("offset_y", d.offset_y).with_range(0.0, 1.0),
            rotation_deg: Value::new("rotation_deg", d.rotation_deg)
                .with_range(-180.0, 180.0)
                .with_units("deg"),
            pixel_time_us: Value::new("pixel_time_us", d.pixel_time_us)
                .with_range(0.01, 10_000.0)
                .with_units("µs"),
            retrace_fraction: Value::new("retrace_fraction", d.retrace_fraction)
                .with_range(0.0, 1.0),
            cutoff_fraction: Value::new("cutoff_fraction", d.cutoff_fraction)
                .with_range(0.0, 1.0),
            turning_fraction: Value::new("turning_fraction", d.turning_fraction)
                .with_range(0.0, 1.0),
            planes: Value::new("planes", d.planes).with_range(1, 1024),
            plane_step_volts: Value::new("plane_step_volts", d.plane_step_volts)
                .with_range(-20.0, 20.0)
                .with_units("V"),
            active_preset: Value::new("active_preset", String::new()),
            presets: RwLock::new(Vec::new()),
            edit: ReentrantMutex::new(()),
        }
    }

    /// Build a geometry from stored values, validating every field against its bounds.
    pub fn from_snapshot(snapshot: &GeometrySnapshot, presets: &[Preset]) -> AppResult<Self> {
        let geometry = Self::new();
        for preset in presets {
            geometry.add_preset(preset.clone());
        }
        geometry.apply_snapshot(snapshot)?;
        Ok(geometry)
    }

    /// Run several edits as one unit with respect to [`snapshot`](Self::snapshot).
    pub fn transaction<R>(&self, edit: impl FnOnce(&Self) -> AppResult<R>) -> AppResult<R> {
        let _guard = self.edit.lock();
        edit(self)
    }

    /// Copy all fields at one instant.
    ///
    /// In Sawtooth mode an active preset overrides resolution, pixel time and retrace.
    pub fn snapshot(&self) -> GeometrySnapshot {
        let _guard = self.edit.lock();
        let mut snapshot = GeometrySnapshot {
            mode: self.mode.get(),
            resolution_x: self.resolution_x.get(),
            resolution_y: self.resolution_y.get(),
            zoom: self.zoom.get(),
            offset_x: self.offset_x.get(),
            offset_y: self.offset_y.get(),
            rotation_deg: self.rotation_deg.get(),
            pixel_time_us: self.pixel_time_us.get(),
            retrace_fraction: self.retrace_fraction.get(),
            cutoff_fraction: self.cutoff_fraction.get(),
            turning_fraction: self.turning_fraction.get(),
            planes: self.planes.get(),
            plane_step_volts: self.plane_step_volts.get(),
            preset: None,
        };

        if snapshot.mode == ScanMode::Sawtooth {
            let active = self.active_preset.get();
            if !active.is_empty() {
                if let Some(preset) = self.preset(&active) {
                    snapshot.resolution_x = preset.resolution_x;
                    snapshot.resolution_y = preset.resolution_y;
                    snapshot.pixel_time_us = preset.pixel_time_us;
                    snapshot.retrace_fraction = preset.retrace_fraction;
                    snapshot.preset = Some(preset.name);
                }
            }
        }
        snapshot
    }

    /// Write every field of `snapshot` (except `preset`) as one transaction.
    pub fn apply_snapshot(&self, snapshot: &GeometrySnapshot) -> AppResult<()> {
        self.transaction(|g| {
            g.mode.set(snapshot.mode)?;
            g.resolution_x.set(snapshot.resolution_x)?;
            g.resolution_y.set(snapshot.resolution_y)?;
            g.zoom.set(snapshot.zoom)?;
            g.offset_x.set(snapshot.offset_x)?;
            g.offset_y.set(snapshot.offset_y)?;
            g.rotation_deg.set(snapshot.rotation_deg)?;
            g.pixel_time_us.set(snapshot.pixel_time_us)?;
            g.retrace_fraction.set(snapshot.retrace_fraction)?;
            g.cutoff_fraction.set(snapshot.cutoff_fraction)?;
            g.turning_fraction.set(snapshot.turning_fraction)?;
            g.planes.set(snapshot.planes)?;
            g.plane_step_volts.set(snapshot.plane_step_volts)?;
            Ok(())
        })
    }

    /// Add or replace a preset by name.
    pub fn add_preset(&self, preset: Preset) {
        let mut presets = self.presets.write();
        match presets.iter_mut().find(|p| p.name == preset.name) {
            Some(existing) => *existing = preset,
            None => presets.push(preset),
        }
    }

    /// Remove a preset. Clears `active_preset` if it named this preset.
    pub fn remove_preset(&self, name: &str) -> AppResult<bool> {
        let removed = {
            let mut presets = self.presets.write();
            let before = presets.len();
            presets.retain(|p| p.name != name);
            presets.len() != before
        };
        if removed && self.active_preset.get() == name {
            self.active_preset.set(String::new())?;
        }
        Ok(removed)
    }

    /// Look up a preset by name.
    pub fn preset(&self, name: &str) -> Option<Preset> {
        self.presets.read().iter().find(|p| p.name == name).cloned()
    }

    /// All presets in insertion order.
    pub fn presets(&self) -> Vec<Preset> {
        self.presets.read().clone()
    }

    /// Make `name` the active preset and copy its fields into the live values.
    pub fn apply_preset(&self, name: &str) -> AppResult<()> {
        let preset = self.preset(name).ok_or_else(|| {
            DaqError::Configuration(format!("Unknown preset '{}'", name))
        })?;
        self.transaction(|g| {
            g.resolution_x.set(preset.resolution_x)?;
            g.resolution_y.set(preset.resolution_y)?;
            g.pixel_time_us.set(preset.pixel_time_us)?;
            g.retrace_fraction.set(preset.retrace_fraction)?;
            g.active_preset.set(preset.name.clone())?;
            Ok(())
        })?;
        info!(preset = name, "Applied scan preset");
        Ok(())
    }

    /// Store a coerced pixel time in the live field and, if given, in the preset it came from.
    pub fn write_back_pixel_time(&self, pixel_time_us: f64, preset: Option<&str>) -> AppResult<()> {
        self.transaction(|g| {
            g.pixel_time_us.set(pixel_time_us).map_err(|e| {
                DaqError::CoercionFailed(format!(
                    "cannot store coerced pixel time {} µs: {}",
                    pixel_time_us, e
                ))
            })?;
            if let Some(name) = preset {
                let mut presets = g.presets.write();
                if let Some(p) = presets.iter_mut().find(|p| p.name == name) {
                    p.pixel_time_us = pixel_time_us;
                }
            }
            Ok(())
        })?;
        debug!(pixel_time_us, ?preset, "Wrote back coerced pixel time");
        Ok(())
    }

    /// Gate the fields that shape the output sequence while a scan is running.
    ///
    /// Offsets and rotation stay editable; they take effect on the next rebuild.
    ///
    /// A field whose own subscriber is running cannot be toggled; it is
    /// skipped with a warning.
    pub fn lock_for_acquisition(&self, locked: bool) {
        let results = [
            self.mode.set_read_only(locked),
            self.resolution_x.set_read_only(locked),
            self.resolution_y.set_read_only(locked),
            self.zoom.set_read_only(locked),
            self.pixel_time_us.set_read_only(locked),
            self.retrace_fraction.set_read_only(locked),
            self.cutoff_fraction.set_read_only(locked),
            self.turning_fraction.set_read_only(locked),
            self.planes.set_read_only(locked),
            self.active_preset.set_read_only(locked),
        ];
        for error in results.into_iter().filter_map(Result::err) {
            warn!(%error, locked, "Geometry field lock not changed");
        }
    }

    /// Serialise fields and presets into a parameter tree.
    pub fn to_tree(&self) -> AppResult<ParameterTree> {
        let mut tree = ParameterTree::from_serialize(&self.snapshot_raw())?;
        tree.insert_serialize("presets", &self.presets())?;
        tree.insert_serialize("active_preset", &self.active_preset.get())?;
        Ok(tree)
    }

    /// Load fields and presets from a parameter tree produced by [`to_tree`](Self::to_tree).
    pub fn apply_tree(&self, tree: &ParameterTree) -> AppResult<()> {
        let snapshot: GeometrySnapshot = tree.deserialize()?;
        let presets: Vec<Preset> = tree.get_deserialize("presets")?.unwrap_or_default();
        let active: String = tree.get_deserialize("active_preset")?.unwrap_or_default();
        self.transaction(|g| {
            for preset in presets {
                g.add_preset(preset);
            }
            g.apply_snapshot(&snapshot)?;
            g.active_preset.set(active)?;
            Ok(())
        })
    }

    /// Snapshot of the live fields without preset resolution.
    fn snapshot_raw(&self) -> GeometrySnapshot {
        let _guard = self.edit.lock();
        let mut snapshot = self.snapshot();
        snapshot.resolution_x = self.resolution_x.get();
        snapshot.resolution_y = self.resolution_y.get();
        snapshot.pixel_time_us = self.pixel_time_us.get();
        snapshot.retrace_fraction = self.retrace_fraction.get();
        snapshot.preset = None;
        snapshot
    }
}
