//! Master/slave synchronized start across areas.

mod common;

use std::time::{Duration, Instant};

use common::{fast_pipeline, Rig};
use scan_daq::config::{PipelineConfig, StartOrder};
use scan_daq::controller::StageKind;
use scan_daq::error::DaqError;
use scan_daq::hardware::mock::{EventKind, MockOptions};
use scan_daq::orchestrator::Orchestrator;

fn finite(frames: u64) -> PipelineConfig {
    PipelineConfig {
        frame_count: Some(frames),
        ..fast_pipeline()
    }
}

#[test]
fn test_master_outputs_start_after_every_input() {
    let rig = Rig::new(vec![MockOptions::default(); 3]);
    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &finite(2)).unwrap();
    orchestrator.wait().unwrap();

    let master_out = rig.log.position(0, EventKind::OutputsStarted).unwrap();
    for area in 0..3 {
        let inputs = rig.log.position(area, EventKind::InputsStarted).unwrap();
        assert!(inputs < master_out, "area {} inputs after trigger", area);
        let configured = rig.log.position(area, EventKind::OutputsConfigured).unwrap();
        assert!(configured < master_out);
    }
    for area in 1..3 {
        let slave_out = rig.log.position(area, EventKind::OutputsStarted).unwrap();
        assert!(slave_out < master_out);
    }
    for storage in &rig.storages {
        assert_eq!(storage.len(), 2);
    }
}

#[test]
fn test_outputs_first_order() {
    let rig = Rig::new(vec![MockOptions::default(); 2]);
    let pipeline = PipelineConfig {
        start_order: StartOrder::OutputsFirst,
        ..finite(1)
    };
    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &pipeline).unwrap();
    orchestrator.wait().unwrap();

    let slave_out = rig.log.position(1, EventKind::OutputsStarted).unwrap();
    let slave_in = rig.log.position(1, EventKind::InputsStarted).unwrap();
    let master_in = rig.log.position(0, EventKind::InputsStarted).unwrap();
    let master_out = rig.log.position(0, EventKind::OutputsStarted).unwrap();
    assert!(slave_out < slave_in);
    assert!(slave_in < master_in);
    assert!(master_in < master_out);
}

#[test]
fn test_slow_slave_delays_trigger() {
    let slow = MockOptions {
        configure_delay_ms: 200,
        ..MockOptions::default()
    };
    let rig = Rig::new(vec![MockOptions::default(), slow]);

    let started = Instant::now();
    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &finite(1)).unwrap();
    orchestrator.wait().unwrap();

    let events = rig.log.events();
    let fired = events
        .iter()
        .find(|e| e.kind == EventKind::TriggerFired)
        .unwrap();
    assert!(fired.at.duration_since(started) >= Duration::from_millis(200));
    assert!(
        rig.log.position(1, EventKind::OutputsConfigured).unwrap()
            < rig.log.position(0, EventKind::TriggerFired).unwrap()
    );
    assert_eq!(rig.storages[1].len(), 1);
}

#[test]
fn test_slave_start_timeout_aborts_all_areas() {
    let stuck = MockOptions {
        configure_delay_ms: 10_000,
        ..MockOptions::default()
    };
    let rig = Rig::new(vec![MockOptions::default(), stuck, MockOptions::default()]);
    let pipeline = PipelineConfig {
        start_timeout_ms: 150,
        ..fast_pipeline()
    };

    let started = Instant::now();
    let err = Orchestrator::start(rig.setups(), &rig.device, &pipeline).unwrap_err();

    assert!(matches!(
        err,
        DaqError::StartFailed {
            area: 1,
            stage: StageKind::Daq,
            ..
        }
    ));
    // Stopping the backends interrupts the stuck configure.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!rig.log.contains(EventKind::TriggerFired));
    assert!(!rig.log.contains(EventKind::OutputsStarted));
    assert!(rig.log.position(2, EventKind::OutputsConfigured).is_none());
    for geometry in &rig.geometries {
        assert!(!geometry.resolution_x.is_read_only());
    }
    assert_eq!(rig.backends[0].chunks_read(), 0);
}

#[test]
fn test_configure_failure_reports_area() {
    let failing = MockOptions {
        fail_configure: Some("AO task reserved".into()),
        ..MockOptions::default()
    };
    let rig = Rig::new(vec![MockOptions::default(), failing]);
    let err = Orchestrator::start(rig.setups(), &rig.device, &fast_pipeline()).unwrap_err();

    match err {
        DaqError::StartFailed { area, stage, reason } => {
            assert_eq!(area, 1);
            assert_eq!(stage, StageKind::Daq);
            assert!(reason.contains("AO task reserved"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!rig.log.contains(EventKind::TriggerFired));
}

#[test]
fn test_external_trigger_waits_for_edge() {
    let rig = Rig::new(vec![MockOptions::default(); 2]);
    let pipeline = PipelineConfig {
        external_trigger: true,
        ..finite(1)
    };
    let mut orchestrator = Orchestrator::start(rig.setups(), &rig.device, &pipeline).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rig.backends[0].chunks_read(), 0);
    assert_eq!(rig.backends[1].chunks_read(), 0);

    rig.trigger.fire();
    orchestrator.wait().unwrap();
    assert_eq!(rig.storages[0].len(), 1);
    assert_eq!(rig.storages[1].len(), 1);
}
