//! End-to-end acquisitions through the mock backend.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{fast_pipeline, Rig};
use scan_daq::config::PipelineConfig;
use scan_daq::controller::{DisplayPolicy, StageState};
use scan_daq::error::DaqError;
use scan_daq::geometry::ScanGeometry;
use scan_daq::hardware::mock::MockOptions;
use scan_daq::orchestrator::Orchestrator;
use scan_daq::sink::MemoryStorage;

#[test]
fn test_256_square_frame_assembles_to_pixel_grid() {
    let geometry = ScanGeometry::new();
    geometry.resolution_x.set(256).unwrap();
    geometry.resolution_y.set(256).unwrap();
    geometry.pixel_time_us.set(6.0).unwrap();
    geometry.retrace_fraction.set(0.1).unwrap();

    let mut rig = Rig::with_geometries(vec![MockOptions::default()], vec![geometry]);
    rig.chunk_samples = 16_384;
    let pipeline = PipelineConfig {
        frame_count: Some(1),
        ..fast_pipeline()
    };

    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &pipeline).unwrap();
    let layout = orchestrator.layout(0).cloned().unwrap();
    assert_eq!(layout.samples_per_pixel, 6);
    assert_eq!(layout.line_samples, 1690);
    assert_eq!(layout.frame_samples(), 256 * 1690);
    assert!((layout.frame_duration().as_secs_f64() - 0.43264).abs() < 1e-9);

    orchestrator.wait().unwrap();

    let images = rig.storages[0].images();
    assert_eq!(images.len(), 1);
    let image = &images[0];
    assert_eq!(image.pixel_count(), 256 * 256);
    assert_eq!(image.channels[0].len(), 65_536);
    assert_eq!(image.metadata.frame_samples, 432_640);
    assert_eq!(image.metadata.run_id, orchestrator.run_id());

    // Mock detector signal grows with both scan axes.
    let left = image.get(0, 10, 128).unwrap();
    let right = image.get(0, 240, 128).unwrap();
    let top = image.get(0, 128, 10).unwrap();
    let bottom = image.get(0, 128, 240).unwrap();
    assert!(right > left, "{} vs {}", right, left);
    assert!(bottom > top, "{} vs {}", bottom, top);
    assert_eq!(rig.storages[0].flush_count(), 1);
}

#[test]
fn test_slow_storage_applies_backpressure_without_loss() {
    let rig = Rig::new(vec![MockOptions::default()])
        .with_storage(0, MemoryStorage::with_write_delay(Duration::from_millis(15)));
    let pipeline = PipelineConfig {
        storage_queue_capacity: 1,
        daq_queue_capacity: 2,
        display_queue_capacity: 1,
        display_policy: DisplayPolicy::DropOldest,
        frame_count: Some(8),
        ..fast_pipeline()
    };

    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &pipeline).unwrap();
    orchestrator.wait().unwrap();

    let sequences: Vec<u64> = rig.storages[0].images().iter().map(|i| i.sequence).collect();
    assert_eq!(sequences, (0..8).collect::<Vec<_>>());
    assert!(rig.displays[0].shown() <= 8);
    assert_eq!(rig.displays[0].latest().map(|i| i.sequence), Some(7));
}

#[test]
fn test_geometry_locked_while_running() {
    let rig = Rig::new(vec![MockOptions::default()]);
    let geometry = Arc::clone(&rig.geometries[0]);

    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &fast_pipeline()).unwrap();
    assert!(matches!(
        geometry.zoom.set(2.0),
        Err(DaqError::ReadOnly { .. })
    ));
    assert!(geometry.offset_x.set(0.4).is_ok());

    thread::sleep(Duration::from_millis(50));
    orchestrator.stop().unwrap();

    assert!(orchestrator.is_idle());
    assert!(geometry.zoom.set(2.0).is_ok());
    assert!(!rig.storages[0].is_empty());
}

#[test]
fn test_stop_drains_in_sequence() {
    let rig = Rig::new(vec![MockOptions::default()]);
    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &fast_pipeline()).unwrap();
    thread::sleep(Duration::from_millis(30));
    orchestrator.stop().unwrap();

    let images = rig.storages[0].images();
    for (expected, image) in images.iter().enumerate() {
        assert_eq!(image.sequence, expected as u64);
        assert_eq!(image.pixel_count(), 32);
    }
    assert!(orchestrator
        .stage_states()
        .iter()
        .all(|(_, _, s)| *s == StageState::Idle));
}

#[test]
fn test_plane_hopper_tags_planes() {
    let geometry = common::small_geometry();
    geometry.mode.set(scan_daq::ScanMode::PlaneHopper).unwrap();
    geometry.planes.set(3).unwrap();

    let rig = Rig::with_geometries(vec![MockOptions::default()], vec![geometry]);
    let pipeline = PipelineConfig {
        frame_count: Some(2),
        ..fast_pipeline()
    };
    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &pipeline).unwrap();
    orchestrator.wait().unwrap();

    let planes: Vec<u32> = rig.storages[0].images().iter().map(|i| i.plane).collect();
    assert_eq!(planes, vec![0, 1, 2, 0, 1, 2]);
}

#[test]
fn test_unbuildable_geometry_fails_before_hardware() {
    let geometry = common::small_geometry();
    geometry.offset_x.set(1.0).unwrap();

    let rig = Rig::with_geometries(vec![MockOptions::default()], vec![geometry]);
    let err = Orchestrator::start(rig.setups(), &rig.device, &fast_pipeline()).unwrap_err();
    assert!(matches!(err, DaqError::UnsupportedGeometry(_)));
    assert!(rig.log.events().is_empty());
    assert!(!rig.geometries[0].zoom.is_read_only());
}
