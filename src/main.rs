//! CLI entry point for scan-daq.
//!
//! - `run`: acquire with simulated hardware from a configuration file
//! - `waveform`: build every area's scanner vector and print its timing
//! - `defaults`: print the default configuration as TOML
//!
//! # Usage
//!
//! ```bash
//! scan-daq defaults > scan-daq.toml
//! scan-daq waveform --config scan-daq.toml
//! scan-daq run --config scan-daq.toml --frames 4 --state geometry.toml --metadata run.json
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use scan_daq::config::{apply_geometry_tree, geometry_tree, AppConfig, ConfigStore, TomlStore};
use scan_daq::data::ScanMetadata;
use scan_daq::geometry::ScanGeometry;
use scan_daq::hardware::mock::{EventLog, MockBackend, TriggerLine};
use scan_daq::logging;
use scan_daq::orchestrator::{AreaSetup, Orchestrator};
use scan_daq::scanner::ScannerVector;
use scan_daq::sink::{LatestFrameDisplay, MemoryStorage};

#[derive(Parser)]
#[command(name = "scan-daq")]
#[command(about = "Multi-area laser-scanning acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire with simulated hardware
    Run {
        /// Configuration file (TOML)
        #[arg(long, default_value = "scan-daq.toml")]
        config: PathBuf,

        /// Output cycles to acquire; overrides pipeline.frame_count
        #[arg(long)]
        frames: Option<u64>,

        /// Run time when no frame count is set
        #[arg(long, default_value = "1000")]
        duration_ms: u64,

        /// Load geometry from and save it back to this file
        #[arg(long)]
        state: Option<PathBuf>,

        /// Write per-area scan metadata as JSON
        #[arg(long)]
        metadata: Option<PathBuf>,
    },

    /// Print coerced timing for every area
    Waveform {
        /// Configuration file (TOML)
        #[arg(long, default_value = "scan-daq.toml")]
        config: PathBuf,
    },

    /// Print the default configuration
    Defaults,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            frames,
            duration_ms,
            state,
            metadata,
        } => run(
            &config,
            frames,
            Duration::from_millis(duration_ms),
            state,
            metadata,
        ),
        Commands::Waveform { config } => waveform(&config),
        Commands::Defaults => {
            print!("{}", AppConfig::with_default_area().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate().context("validating configuration")?;
    logging::init_from_config(&config)?;
    Ok(config)
}

fn build_geometries(config: &AppConfig) -> Result<Vec<Arc<ScanGeometry>>> {
    config
        .areas
        .iter()
        .map(|area| {
            area.build_geometry()
                .map(Arc::new)
                .with_context(|| format!("area '{}'", area.name))
        })
        .collect()
}

fn run(
    path: &Path,
    frames: Option<u64>,
    duration: Duration,
    state: Option<PathBuf>,
    metadata: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(path)?;
    if frames.is_some() {
        config.pipeline.frame_count = frames;
    }

    let geometries = build_geometries(&config)?;
    let store = state.map(TomlStore::new);
    if let Some(store) = &store {
        let tree = store.load()?;
        let applied = apply_geometry_tree(
            &tree,
            config
                .areas
                .iter()
                .zip(&geometries)
                .map(|(a, g)| (a.name.as_str(), g.as_ref())),
        )?;
        info!(path = %store.path().display(), applied, "Restored geometry");
    }

    let trigger = TriggerLine::new();
    let log = EventLog::new();
    let mut storages = Vec::new();
    let mut setups = Vec::new();
    for (index, (area, geometry)) in config.areas.iter().zip(&geometries).enumerate() {
        let storage = Arc::new(MemoryStorage::new());
        storages.push(Arc::clone(&storage));
        setups.push(AreaSetup {
            name: area.name.clone(),
            geometry: Arc::clone(geometry),
            backend: Arc::new(MockBackend::new(
                index,
                config.device.scan_range_volts,
                area.mock.clone(),
                trigger.clone(),
                log.clone(),
            )),
            input_channels: area.input_channels,
            chunk_samples: area.chunk_samples,
            storage,
            display: Arc::new(LatestFrameDisplay::new()),
        });
    }

    let mut orchestrator = Orchestrator::start(setups, &config.device, &config.pipeline)?;
    if let Some(path) = &metadata {
        let records: Vec<ScanMetadata> = (0..orchestrator.area_count())
            .filter_map(|area| orchestrator.metadata(area))
            .map(|m| m.as_ref().clone())
            .collect();
        let file = File::create(path)
            .with_context(|| format!("creating metadata file {}", path.display()))?;
        serde_json::to_writer_pretty(file, &records)?;
        info!(path = %path.display(), "Scan metadata written");
    }
    let outcome = if config.pipeline.frame_count.is_some() {
        orchestrator.wait()
    } else {
        std::thread::sleep(duration);
        orchestrator.stop()
    };

    for (area, storage) in config.areas.iter().zip(&storages) {
        let images = storage.images();
        let mean = images.last().map_or(0.0, |image| image.mean(0));
        println!(
            "{}: {} images stored, last mean {:.1} counts",
            area.name,
            images.len(),
            mean
        );
    }

    if let Some(store) = &store {
        store.save(&geometry_tree(
            config
                .areas
                .iter()
                .zip(&geometries)
                .map(|(a, g)| (a.name.as_str(), g.as_ref())),
        )?)?;
    }

    outcome.context("acquisition failed")?;
    Ok(())
}

fn waveform(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let geometries = build_geometries(&config)?;

    for (index, (area, geometry)) in config.areas.iter().zip(&geometries).enumerate() {
        let mut scanner = ScannerVector::new(index, geometry.mode.get());
        let samples = scanner
            .build(geometry, &config.device)
            .with_context(|| format!("building area '{}'", area.name))?
            .len();
        let (Some(layout), Some(timing)) = (scanner.layout(), scanner.pixel_timing()) else {
            continue;
        };
        println!("{} ({})", area.name, layout.mode);
        println!(
            "  pixel time      {:.3} us{}",
            timing.pixel_time_us,
            if timing.coerced { " (coerced)" } else { "" }
        );
        println!("  samples/pixel   {}", timing.samples_per_pixel);
        println!("  line samples    {}", layout.line_samples);
        println!("  frame samples   {}", layout.frame_samples());
        println!("  cycle samples   {}", samples);
        println!("  frame duration  {:?}", layout.frame_duration());
    }
    Ok(())
}
