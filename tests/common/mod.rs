//! Shared rig for integration tests: mock backends on one trigger line.
#![allow(dead_code)]

use std::sync::Arc;

use scan_daq::config::PipelineConfig;
use scan_daq::geometry::ScanGeometry;
use scan_daq::hardware::mock::{EventLog, MockBackend, MockOptions, TriggerLine};
use scan_daq::orchestrator::AreaSetup;
use scan_daq::sink::{LatestFrameDisplay, MemoryStorage, StorageSink};
use scan_daq::timing::DeviceTiming;

/// 8×4 sawtooth at 2 µs: 18-sample lines, 72-sample frames.
pub fn small_geometry() -> ScanGeometry {
    let g = ScanGeometry::new();
    g.resolution_x.set(8).unwrap();
    g.resolution_y.set(4).unwrap();
    g
}

/// Pipeline settings with short polls so tests shut down quickly.
pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        poll_interval_ms: 2,
        start_timeout_ms: 2_000,
        ..PipelineConfig::default()
    }
}

pub struct Rig {
    pub device: DeviceTiming,
    pub trigger: TriggerLine,
    pub log: EventLog,
    pub geometries: Vec<Arc<ScanGeometry>>,
    pub backends: Vec<Arc<MockBackend>>,
    pub storages: Vec<Arc<MemoryStorage>>,
    pub displays: Vec<Arc<LatestFrameDisplay>>,
    pub chunk_samples: usize,
}

impl Rig {
    /// One area per entry in `options`, each with `small_geometry()`.
    pub fn new(options: Vec<MockOptions>) -> Self {
        let geometries = options.iter().map(|_| small_geometry()).collect();
        Self::with_geometries(options, geometries)
    }

    pub fn with_geometries(options: Vec<MockOptions>, geometries: Vec<ScanGeometry>) -> Self {
        let device = DeviceTiming::default();
        let trigger = TriggerLine::new();
        let log = EventLog::new();
        let backends = options
            .into_iter()
            .enumerate()
            .map(|(area, opts)| {
                Arc::new(MockBackend::new(
                    area,
                    device.scan_range_volts,
                    opts,
                    trigger.clone(),
                    log.clone(),
                ))
            })
            .collect::<Vec<_>>();
        let n = backends.len();
        Self {
            device,
            trigger,
            log,
            geometries: geometries.into_iter().map(Arc::new).collect(),
            backends,
            storages: (0..n).map(|_| Arc::new(MemoryStorage::new())).collect(),
            displays: (0..n).map(|_| Arc::new(LatestFrameDisplay::new())).collect(),
            chunk_samples: 36,
        }
    }

    pub fn with_storage(mut self, area: usize, storage: MemoryStorage) -> Self {
        self.storages[area] = Arc::new(storage);
        self
    }

    pub fn setups(&self) -> Vec<AreaSetup> {
        (0..self.backends.len())
            .map(|area| AreaSetup {
                name: format!("area{}", area),
                geometry: Arc::clone(&self.geometries[area]),
                backend: self.backends[area].clone(),
                input_channels: 1,
                chunk_samples: self.chunk_samples,
                storage: self.storages[area].clone() as Arc<dyn StorageSink>,
                display: self.displays[area].clone(),
            })
            .collect()
    }
}
