//! Configuration loading and the persisted parameter tree.
//!
//! [`AppConfig`] is loaded with figment from, in increasing priority:
//! 1. built-in defaults (`AppConfig::default()`)
//! 2. a TOML file
//! 3. environment variables prefixed `SCAN_DAQ_`, nested with `__`
//!    (e.g. `SCAN_DAQ_PIPELINE__FRAME_COUNT=10`)
//!
//! # Example
//! ```no_run
//! use scan_daq::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/scan.toml")?;
//! config.validate()?;
//! println!("{} areas", config.areas.len());
//! # Ok::<(), scan_daq::error::DaqError>(())
//! ```
//!
//! Live geometry is persisted separately through a [`ConfigStore`]: a
//! [`ParameterTree`] keyed by area name, so coerced pixel times and preset
//! edits survive a restart.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::controller::DisplayPolicy;
use crate::error::{AppResult, DaqError};
use crate::geometry::{GeometrySnapshot, Preset, ScanGeometry};
use crate::hardware::mock::MockOptions;
use crate::limits::{
    validate_chunk_shape, validate_queue_capacity, DEFAULT_POLL_INTERVAL, DEFAULT_START_TIMEOUT,
    MAX_AREAS,
};
use crate::timing::DeviceTiming;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SCAN_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Output/input device timing shared by all areas
    pub device: DeviceTiming,
    /// Queue sizes, start protocol and run length
    pub pipeline: PipelineConfig,
    /// Areas; the first one is the master
    pub areas: Vec<AreaConfig>,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scan-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Order in which the orchestrator starts hardware tasks.
///
/// Either way the master's output task starts last, since it fires the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartOrder {
    /// All input tasks, then all output tasks
    #[default]
    InputsFirst,
    /// All slave output tasks, then all input tasks
    OutputsFirst,
}

/// Pipeline wiring and run control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Daq → Pipeline queue capacity (chunks)
    pub daq_queue_capacity: usize,
    /// Pipeline → Storage queue capacity (images)
    pub storage_queue_capacity: usize,
    /// Pipeline → Display queue capacity (images)
    pub display_queue_capacity: usize,
    /// Behaviour when the display queue is full
    pub display_policy: DisplayPolicy,
    /// Hardware task start order
    pub start_order: StartOrder,
    /// Bound on each controller reaching `Running`, in milliseconds
    pub start_timeout_ms: u64,
    /// Fail if no data arrives this long after arming; unset waits forever
    pub trigger_timeout_ms: Option<u64>,
    /// Cancellation polling interval of blocked workers, in milliseconds
    pub poll_interval_ms: u64,
    /// Stop after this many output cycles; unset runs until stopped
    pub frame_count: Option<u64>,
    /// The master waits for an external trigger instead of emitting one
    pub external_trigger: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            daq_queue_capacity: 32,
            storage_queue_capacity: 16,
            display_queue_capacity: 2,
            display_policy: DisplayPolicy::DropOldest,
            start_order: StartOrder::InputsFirst,
            start_timeout_ms: DEFAULT_START_TIMEOUT.as_millis() as u64,
            trigger_timeout_ms: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            frame_count: None,
            external_trigger: false,
        }
    }
}

impl PipelineConfig {
    /// Start rendezvous bound.
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Trigger wait bound, if any.
    pub fn trigger_timeout(&self) -> Option<Duration> {
        self.trigger_timeout_ms.map(Duration::from_millis)
    }

    /// Worker cancellation polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// One scanned area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaConfig {
    /// Unique area name
    pub name: String,
    /// Detector channels sampled per area
    pub input_channels: usize,
    /// Samples per channel per Daq chunk
    pub chunk_samples: usize,
    /// Initial scan geometry (includes the scan mode)
    pub geometry: GeometrySnapshot,
    /// Named presets
    pub presets: Vec<Preset>,
    /// Preset applied by Sawtooth builds
    pub active_preset: Option<String>,
    /// Simulated device behaviour
    pub mock: MockOptions,
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self {
            name: "area0".to_string(),
            input_channels: 1,
            chunk_samples: 4096,
            geometry: GeometrySnapshot::default(),
            presets: Vec::new(),
            active_preset: None,
            mock: MockOptions::default(),
        }
    }
}

impl AreaConfig {
    /// Live geometry for this area, validated against parameter bounds.
    pub fn build_geometry(&self) -> AppResult<ScanGeometry> {
        let geometry = ScanGeometry::from_snapshot(&self.geometry, &self.presets)?;
        if let Some(name) = &self.active_preset {
            if geometry.preset(name).is_none() {
                return Err(DaqError::Configuration(format!(
                    "area '{}': active_preset '{}' is not defined",
                    self.name, name
                )));
            }
            geometry.active_preset.set(name.clone())?;
        }
        Ok(geometry)
    }
}

impl AppConfig {
    /// Defaults with a single area, suitable for `defaults` output.
    pub fn with_default_area() -> Self {
        Self {
            areas: vec![AreaConfig::default()],
            ..Self::default()
        }
    }

    /// Load from defaults, a TOML file, and `SCAN_DAQ_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let config: AppConfig = Figment::from(Serialized::defaults(Self::with_default_area()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Load from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(Self::with_default_area()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Serialize as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        self.device.validate()?;

        let p = &self.pipeline;
        validate_queue_capacity("daq_queue_capacity", p.daq_queue_capacity)?;
        validate_queue_capacity("storage_queue_capacity", p.storage_queue_capacity)?;
        validate_queue_capacity("display_queue_capacity", p.display_queue_capacity)?;
        if p.start_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "start_timeout_ms must be positive".into(),
            ));
        }
        if p.frame_count == Some(0) {
            return Err(DaqError::Configuration(
                "frame_count must be positive when set".into(),
            ));
        }

        if self.areas.is_empty() || self.areas.len() > MAX_AREAS {
            return Err(DaqError::Configuration(format!(
                "Between 1 and {} areas required, got {}",
                MAX_AREAS,
                self.areas.len()
            )));
        }
        let mut names = HashSet::new();
        for area in &self.areas {
            if !names.insert(area.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate area name: {}",
                    area.name
                )));
            }
            validate_chunk_shape(area.input_channels, area.chunk_samples)?;
            area.build_geometry().map_err(|e| {
                DaqError::Configuration(format!("area '{}': {}", area.name, e))
            })?;
        }
        Ok(())
    }
}

/// Hierarchical key/value document for persisted parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTree(toml::Table);

impl ParameterTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tree from any value that serializes to a table.
    pub fn from_serialize<T: Serialize>(value: &T) -> AppResult<Self> {
        match toml::Value::try_from(value)? {
            toml::Value::Table(table) => Ok(Self(table)),
            other => Err(DaqError::Serialize(format!(
                "expected a table, got {}",
                other.type_str()
            ))),
        }
    }

    /// Deserialize the whole tree.
    pub fn deserialize<T: DeserializeOwned>(&self) -> AppResult<T> {
        toml::Value::Table(self.0.clone())
            .try_into()
            .map_err(|e: toml::de::Error| DaqError::Serialize(e.to_string()))
    }

    /// Deserialize one key, `None` if absent.
    pub fn get_deserialize<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        self.0
            .get(key)
            .map(|v| {
                v.clone()
                    .try_into()
                    .map_err(|e: toml::de::Error| DaqError::Serialize(format!("{}: {}", key, e)))
            })
            .transpose()
    }

    /// Serialize `value` under `key`.
    pub fn insert_serialize<T: Serialize>(&mut self, key: &str, value: &T) -> AppResult<()> {
        self.0.insert(key.to_string(), toml::Value::try_from(value)?);
        Ok(())
    }

    /// Child tree under `key`.
    pub fn subtree(&self, key: &str) -> Option<ParameterTree> {
        match self.0.get(key) {
            Some(toml::Value::Table(t)) => Some(Self(t.clone())),
            _ => None,
        }
    }

    /// Insert a child tree under `key`.
    pub fn insert_subtree(&mut self, key: &str, tree: ParameterTree) {
        self.0.insert(key.to_string(), toml::Value::Table(tree.0));
    }

    /// Raw value under `key`.
    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.0.get(key)
    }

    /// Top-level keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// True if the tree has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse TOML text.
    pub fn parse(text: &str) -> AppResult<Self> {
        text.parse::<toml::Table>()
            .map(Self)
            .map_err(|e| DaqError::Serialize(e.to_string()))
    }

    /// Render as TOML text.
    pub fn to_toml_string(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(&self.0)?)
    }
}

/// Load/save pair for persisted parameters.
pub trait ConfigStore {
    /// Read the stored tree. A store that has never been saved yields an empty tree.
    fn load(&self) -> AppResult<ParameterTree>;
    /// Replace the stored tree.
    fn save(&self, tree: &ParameterTree) -> AppResult<()>;
}

/// [`ConfigStore`] backed by a TOML file.
#[derive(Debug, Clone)]
pub struct TomlStore {
    path: PathBuf,
}

impl TomlStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlStore {
    fn load(&self) -> AppResult<ParameterTree> {
        match fs::read_to_string(&self.path) {
            Ok(text) => ParameterTree::parse(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No stored parameters yet");
                Ok(ParameterTree::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, tree: &ParameterTree) -> AppResult<()> {
        let text = tree.to_toml_string()?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        info!(path = %self.path.display(), "Parameters saved");
        Ok(())
    }
}

/// Tree of every area's geometry keyed by area name.
pub fn geometry_tree<'a>(
    areas: impl IntoIterator<Item = (&'a str, &'a ScanGeometry)>,
) -> AppResult<ParameterTree> {
    let mut tree = ParameterTree::new();
    for (name, geometry) in areas {
        tree.insert_subtree(name, geometry.to_tree()?);
    }
    Ok(tree)
}

/// Apply stored geometry to the named areas; areas missing from the tree are left unchanged.
pub fn apply_geometry_tree<'a>(
    tree: &ParameterTree,
    areas: impl IntoIterator<Item = (&'a str, &'a ScanGeometry)>,
) -> AppResult<usize> {
    let mut applied = 0;
    for (name, geometry) in areas {
        if let Some(subtree) = tree.subtree(name) {
            geometry.apply_tree(&subtree)?;
            applied += 1;
        }
    }
    Ok(applied)
}
