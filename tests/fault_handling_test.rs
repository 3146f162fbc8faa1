//! Runtime faults abort every area with one consolidated error.

mod common;

use std::time::Duration;

use common::{fast_pipeline, Rig};
use scan_daq::config::PipelineConfig;
use scan_daq::controller::StageKind;
use scan_daq::error::DaqError;
use scan_daq::hardware::mock::{EventKind, MockOptions};
use scan_daq::orchestrator::Orchestrator;

#[test]
fn test_mid_run_fault_aborts_all_and_keeps_stored_frames() {
    let faulty = MockOptions {
        fault_after_chunks: Some(40),
        ..MockOptions::default()
    };
    let rig = Rig::new(vec![MockOptions::default(), faulty]);

    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &fast_pipeline()).unwrap();
    let err = orchestrator.wait().unwrap_err();

    match &err {
        DaqError::Aborted { area, stage, source } => {
            assert_eq!(*area, 1);
            assert_eq!(*stage, StageKind::Daq);
            assert!(matches!(**source, DaqError::HardwareFault(_)));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("area 1 daq"));

    // Frames stored before the fault survive, in order.
    let images = rig.storages[1].images();
    assert!(!images.is_empty());
    for (expected, image) in images.iter().enumerate() {
        assert_eq!(image.sequence, expected as u64);
    }
    assert!(orchestrator.is_idle());
    assert!(rig.log.position(0, EventKind::Stopped).is_some());
    assert!(!rig.geometries[0].zoom.is_read_only());
}

#[test]
fn test_trigger_timeout_aborts() {
    let rig = Rig::new(vec![MockOptions::default()]);
    let pipeline = PipelineConfig {
        external_trigger: true,
        trigger_timeout_ms: Some(300),
        ..fast_pipeline()
    };

    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &pipeline).unwrap();
    let err = orchestrator.wait().unwrap_err();

    match err {
        DaqError::Aborted { area, stage, source } => {
            assert_eq!(area, 0);
            assert_eq!(stage, StageKind::Daq);
            match *source {
                DaqError::TriggerTimeout { waited, .. } => {
                    assert!(waited >= Duration::from_millis(300));
                }
                other => panic!("unexpected source: {}", other),
            }
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(rig.storages[0].is_empty());
}

#[test]
fn test_user_abort_is_not_an_error() {
    let rig = Rig::new(vec![MockOptions::default(); 2]);
    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &fast_pipeline()).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    orchestrator.abort().unwrap();
    assert!(orchestrator.is_idle());
}

#[test]
fn test_drop_tears_down_running_acquisition() {
    let rig = Rig::new(vec![MockOptions::default()]);
    {
        let _orchestrator =
            Orchestrator::start(rig.setups(), &rig.device, &fast_pipeline()).unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!rig.geometries[0].zoom.is_read_only());
    assert!(rig.log.contains(EventKind::Stopped));
}

#[test]
fn test_storage_publish_failure_is_consolidated() {
    use scan_daq::data::SharedImage;
    use scan_daq::error::AppResult;
    use scan_daq::sink::StorageSink;
    use std::sync::Arc;

    struct FullDisk;
    impl StorageSink for FullDisk {
        fn publish(&self, _image: SharedImage) -> AppResult<()> {
            Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no space left on device",
            )))
        }
    }

    let rig = Rig::new(vec![MockOptions::default()]);
    let mut setups = rig.setups();
    setups[0].storage = Arc::new(FullDisk);
    let mut orchestrator = Orchestrator::start(setups, &rig.device, &fast_pipeline()).unwrap();

    match orchestrator.wait().unwrap_err() {
        DaqError::Aborted { area, stage, .. } => {
            assert_eq!(area, 0);
            assert_eq!(stage, StageKind::Storage);
        }
        other => panic!("unexpected error: {}", other),
    }
}
