//! Multi-area acquisition: wiring, synchronized start and supervision.
//!
//! Area 0 is the master. Every other area is a slave that waits on the
//! master's trigger. Starting an acquisition runs in three phases:
//!
//! 1. Build each area's [`ScannerVector`] from its geometry and lock the
//!    geometry fields that shape the output sequence.
//! 2. Start every stage controller, downstream first (display, storage,
//!    pipeline, daq). Each `start` is a rendezvous; the daq stage's `prepare`
//!    configures the hardware, so when it returns the area is armed.
//! 3. Start the hardware tasks in the configured [`StartOrder`], always
//!    finishing with the master's output task. That start is the trigger,
//!    and any trigger timeout counts from it.
//!
//! A failure in phase 2 or 3 aborts every controller of every area before the
//! error is returned. Once running, the first [`StageFault`] reported by any
//! stage aborts all areas and becomes the consolidated
//! [`DaqError::Aborted`] error returned by [`Orchestrator::wait`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, StartOrder};
use crate::controller::{
    AbortHandle, DaqWorker, DisplayWorker, PipelineWorker, StageController, StageFault, StageKind,
    StageState, StorageWorker, TaskStartMark,
};
use crate::data::{DaqChunk, ScanMetadata, SharedImage};
use crate::error::{AppResult, DaqError};
use crate::geometry::ScanGeometry;
use crate::hardware::{ChannelSpec, ClockSpec, HardwareBackend, TaskKind, TriggerMode};
use crate::limits::{validate_chunk_shape, MAX_AREAS};
use crate::queue::{Closable, SyncQueue};
use crate::scanner::{FrameLayout, ScannerVector};
use crate::sink::{DisplaySink, StorageSink};
use crate::timing::DeviceTiming;

/// Everything the orchestrator needs to run one area.
#[derive(Clone)]
pub struct AreaSetup {
    /// Area name used in logs and metadata
    pub name: String,
    /// Live geometry, shared with the GUI
    pub geometry: Arc<ScanGeometry>,
    /// Device backend for this area
    pub backend: Arc<dyn HardwareBackend>,
    /// Detector channels
    pub input_channels: usize,
    /// Samples per channel per chunk
    pub chunk_samples: usize,
    /// Persistent consumer
    pub storage: Arc<dyn StorageSink>,
    /// Live-view consumer
    pub display: Arc<dyn DisplaySink>,
}

impl std::fmt::Debug for AreaSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AreaSetup")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .field("input_channels", &self.input_channels)
            .field("chunk_samples", &self.chunk_samples)
            .finish_non_exhaustive()
    }
}

struct AreaRuntime {
    name: String,
    geometry: Arc<ScanGeometry>,
    backend: Arc<dyn HardwareBackend>,
    layout: FrameLayout,
    metadata: Arc<ScanMetadata>,
    daq: StageController,
    pipeline: StageController,
    storage: StageController,
    display: StageController,
}

impl AreaRuntime {
    /// Controllers in start order: downstream first.
    fn controllers(&self) -> [&StageController; 4] {
        [&self.display, &self.storage, &self.pipeline, &self.daq]
    }
}

/// Stage workers built for one area, waiting to be started.
struct PendingWorkers {
    daq: DaqWorker,
    pipeline: PipelineWorker,
    storage: StorageWorker,
    display: DisplayWorker,
}

/// A running multi-area acquisition.
pub struct Orchestrator {
    run_id: Uuid,
    areas: Vec<AreaRuntime>,
    faults: SyncQueue<StageFault>,
    first_error: Arc<Mutex<Option<DaqError>>>,
    supervisor: Option<JoinHandle<()>>,
    tasks_started: TaskStartMark,
    finished: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.run_id)
            .field("areas", &self.areas.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build, arm and trigger an acquisition over `areas`.
    ///
    /// Returns once the master trigger has been issued. Nothing is left
    /// running when this returns an error.
    ///
    /// # Errors
    ///
    /// - [`DaqError::Configuration`] for an empty or oversized area list
    /// - [`DaqError::UnsupportedGeometry`] / [`DaqError::CoercionFailed`] from a
    ///   scanner build, before any hardware call
    /// - [`DaqError::StartFailed`] if a controller or hardware task does not start
    /// - [`DaqError::Aborted`] if a stage faulted while the others were starting
    pub fn start(
        areas: Vec<AreaSetup>,
        device: &DeviceTiming,
        pipeline: &PipelineConfig,
    ) -> AppResult<Self> {
        if areas.is_empty() || areas.len() > MAX_AREAS {
            return Err(DaqError::Configuration(format!(
                "Between 1 and {} areas required, got {}",
                MAX_AREAS,
                areas.len()
            )));
        }
        for setup in &areas {
            validate_chunk_shape(setup.input_channels, setup.chunk_samples)?;
        }
        device.validate()?;

        let run_id = Uuid::new_v4();
        info!(%run_id, areas = areas.len(), order = ?pipeline.start_order, "Starting acquisition");

        // Phase 1: every build must succeed before anything is locked or armed.
        let mut scanners = Vec::with_capacity(areas.len());
        for (index, setup) in areas.iter().enumerate() {
            let mut scanner = ScannerVector::new(index, setup.geometry.mode.get());
            scanner.build(&setup.geometry, device)?;
            scanners.push(scanner);
        }
        for setup in &areas {
            setup.geometry.lock_for_acquisition(true);
        }

        let faults = SyncQueue::new("faults", areas.len() * 4 + 1);
        let mut orchestrator = Self {
            run_id,
            areas: Vec::with_capacity(areas.len()),
            faults: faults.clone(),
            first_error: Arc::new(Mutex::new(None)),
            supervisor: None,
            tasks_started: TaskStartMark::new(),
            finished: false,
        };

        let mut pending = Vec::with_capacity(areas.len());
        for ((index, setup), scanner) in areas.into_iter().enumerate().zip(scanners) {
            match orchestrator.wire_area(index, setup, scanner, device, pipeline) {
                Ok(workers) => pending.push(workers),
                Err(e) => return Err(orchestrator.fail_start(e)),
            }
        }
        orchestrator.spawn_supervisor()?;

        // Phase 2: arm every area.
        let timeout = pipeline.start_timeout();
        for (index, workers) in pending.into_iter().enumerate() {
            let area = &orchestrator.areas[index];
            let started = area
                .display
                .start(workers.display, timeout)
                .and_then(|()| area.storage.start(workers.storage, timeout))
                .and_then(|()| area.pipeline.start(workers.pipeline, timeout))
                .and_then(|()| area.daq.start(workers.daq, timeout));
            if let Err(e) = started {
                return Err(orchestrator.fail_start(e));
            }
            if let Some(e) = orchestrator.take_fault() {
                return Err(orchestrator.fail_start(e));
            }
            debug!(area = index, name = %orchestrator.areas[index].name, "Area armed");
        }

        // Phase 3: hardware tasks, master outputs last.
        for (index, task) in start_sequence(orchestrator.areas.len(), pipeline.start_order) {
            if let Some(e) = orchestrator.take_fault() {
                return Err(orchestrator.fail_start(e));
            }
            let area = &orchestrator.areas[index];
            debug!(area = index, %task, "Starting hardware task");
            if let Err(e) = area.backend.start(task) {
                let err = DaqError::StartFailed {
                    area: index,
                    stage: StageKind::Daq,
                    reason: format!("{} task: {}", task, e),
                };
                return Err(orchestrator.fail_start(err));
            }
        }

        orchestrator.tasks_started.mark();
        info!(
            %run_id,
            external = pipeline.external_trigger,
            "All areas started, trigger issued"
        );
        Ok(orchestrator)
    }

    /// Create the queues, controllers and workers for one area.
    fn wire_area(
        &mut self,
        index: usize,
        setup: AreaSetup,
        scanner: ScannerVector,
        device: &DeviceTiming,
        pipeline: &PipelineConfig,
    ) -> AppResult<PendingWorkers> {
        let (layout, snapshot) = match (scanner.layout(), scanner.snapshot()) {
            (Some(layout), Some(snapshot)) => (layout.clone(), snapshot.clone()),
            _ => {
                return Err(DaqError::UnsupportedGeometry(format!(
                    "area {} scanner vector not built",
                    index
                )))
            }
        };
        let metadata = Arc::new(ScanMetadata::new(
            self.run_id,
            index,
            setup.name.clone(),
            snapshot,
            &layout,
        ));

        let trigger = match (index, pipeline.external_trigger) {
            (0, false) => TriggerMode::Master,
            (0, true) => TriggerMode::External,
            _ => TriggerMode::Slave,
        };
        let clock = ClockSpec {
            sample_rate_hz: device.sample_rate_hz,
            trigger,
        };
        let channels = ChannelSpec {
            channels: setup.input_channels,
            chunk_samples: setup.chunk_samples,
        };
        let poll = pipeline.poll_interval();

        let chunks: SyncQueue<DaqChunk> =
            SyncQueue::new(format!("area{}-chunks", index), pipeline.daq_queue_capacity);
        let to_storage: SyncQueue<SharedImage> = SyncQueue::new(
            format!("area{}-storage", index),
            pipeline.storage_queue_capacity,
        );
        let to_display: SyncQueue<SharedImage> = SyncQueue::new(
            format!("area{}-display", index),
            pipeline.display_queue_capacity,
        );

        let workers = PendingWorkers {
            daq: DaqWorker::new(
                Arc::clone(&setup.backend),
                scanner,
                clock,
                channels,
                chunks.clone(),
            )
            .with_poll_interval(poll)
            .with_trigger_timeout(pipeline.trigger_timeout())
            .with_task_start(self.tasks_started.clone())
            .with_cycle_limit(pipeline.frame_count),
            pipeline: PipelineWorker::new(index, layout.clone(), Arc::clone(&metadata), chunks.clone())
                .with_storage(to_storage.clone())
                .with_display(to_display.clone(), pipeline.display_policy)
                .with_poll_interval(poll),
            storage: StorageWorker::new(to_storage.clone(), Arc::clone(&setup.storage))
                .with_poll_interval(poll),
            display: DisplayWorker::new(to_display.clone(), Arc::clone(&setup.display))
                .with_poll_interval(poll),
        };

        let faults = &self.faults;
        self.areas.push(AreaRuntime {
            name: setup.name,
            geometry: setup.geometry,
            backend: setup.backend,
            layout,
            metadata,
            daq: StageController::new(index, StageKind::Daq, faults.clone())
                .with_outbound(Arc::new(chunks.clone())),
            pipeline: StageController::new(index, StageKind::Pipeline, faults.clone())
                .with_inbound(Arc::new(chunks))
                .with_outbound(Arc::new(to_storage.clone()))
                .with_outbound(Arc::new(to_display.clone())),
            storage: StageController::new(index, StageKind::Storage, faults.clone())
                .with_inbound(Arc::new(to_storage)),
            display: StageController::new(index, StageKind::Display, faults.clone())
                .with_inbound(Arc::new(to_display)),
        });
        Ok(workers)
    }

    fn spawn_supervisor(&mut self) -> AppResult<()> {
        let handles: Vec<AbortHandle> = self
            .areas
            .iter()
            .flat_map(|area| area.controllers().map(StageController::abort_handle))
            .collect();
        let backends: Vec<Arc<dyn HardwareBackend>> =
            self.areas.iter().map(|a| Arc::clone(&a.backend)).collect();
        let faults = self.faults.clone();
        let first_error = Arc::clone(&self.first_error);

        let handle = thread::Builder::new()
            .name("supervisor".into())
            .spawn(move || supervise(&faults, &first_error, &handles, &backends))
            .map_err(|e| DaqError::StartFailed {
                area: 0,
                stage: StageKind::Daq,
                reason: format!("cannot spawn supervisor: {}", e),
            });
        match handle {
            Ok(handle) => {
                self.supervisor = Some(handle);
                Ok(())
            }
            Err(e) => Err(self.fail_start(e)),
        }
    }

    /// Consolidated error of the first runtime fault, if one was reported.
    fn take_fault(&self) -> Option<DaqError> {
        self.first_error.lock().take()
    }

    /// Tear everything down after a start failure and hand back the error.
    fn fail_start(&mut self, error: DaqError) -> DaqError {
        error!(error = %error, "Acquisition start failed, aborting all areas");
        self.abort_all();
        let fault = self.shutdown();
        // A fault recorded during teardown is secondary to the start failure.
        if let Some(fault) = fault {
            debug!(error = %fault, "Fault during start teardown");
        }
        error
    }

    fn abort_all(&self) {
        for area in &self.areas {
            for controller in area.controllers() {
                controller.abort();
            }
        }
        for (index, area) in self.areas.iter().enumerate() {
            if let Err(e) = area.backend.stop() {
                warn!(area = index, error = %e, "Backend stop failed");
            }
        }
    }

    /// Join every thread, release geometry and return the first fault.
    fn shutdown(&mut self) -> Option<DaqError> {
        if self.finished {
            return None;
        }
        for area in &self.areas {
            // Upstream first so each consumer sees its input close.
            area.daq.join();
            area.pipeline.join();
            area.storage.join();
            area.display.join();
        }
        self.faults.close();
        if let Some(supervisor) = self.supervisor.take() {
            if supervisor.join().is_err() {
                error!("Supervisor thread panicked");
            }
        }
        for area in &self.areas {
            area.geometry.lock_for_acquisition(false);
        }
        self.finished = true;
        self.first_error.lock().take()
    }

    /// Block until every area has finished.
    ///
    /// # Errors
    ///
    /// The consolidated [`DaqError::Aborted`] of the first stage that failed.
    pub fn wait(&mut self) -> AppResult<()> {
        match self.shutdown() {
            Some(error) => Err(error),
            None => {
                info!(run_id = %self.run_id, "Acquisition finished");
                Ok(())
            }
        }
    }

    /// Stop acquiring and let queued data drain through to storage.
    pub fn stop(&mut self) -> AppResult<()> {
        info!(run_id = %self.run_id, "Stopping acquisition");
        for area in &self.areas {
            area.daq.stop();
        }
        self.wait()
    }

    /// Abort every area immediately. Images already stored are kept.
    pub fn abort(&mut self) -> AppResult<()> {
        warn!(run_id = %self.run_id, "Aborting acquisition");
        self.abort_all();
        self.wait()
    }

    /// Identifier shared by all images of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Number of areas.
    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    /// Frame layout each area was built with.
    pub fn layout(&self, area: usize) -> Option<&FrameLayout> {
        self.areas.get(area).map(|a| &a.layout)
    }

    /// Metadata attached to each image of `area`.
    pub fn metadata(&self, area: usize) -> Option<Arc<ScanMetadata>> {
        self.areas.get(area).map(|a| Arc::clone(&a.metadata))
    }

    /// Current state of every controller as `(area, stage, state)`.
    pub fn stage_states(&self) -> Vec<(usize, StageKind, StageState)> {
        self.areas
            .iter()
            .flat_map(|area| {
                [&area.daq, &area.pipeline, &area.storage, &area.display]
                    .map(|c| (c.area(), c.stage(), c.state()))
            })
            .collect()
    }

    /// True once every controller has returned to `Idle`.
    pub fn is_idle(&self) -> bool {
        self.stage_states()
            .iter()
            .all(|(_, _, state)| *state == StageState::Idle)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.finished {
            self.abort_all();
            if let Some(error) = self.shutdown() {
                warn!(error = %error, "Acquisition dropped after a fault");
            }
        }
    }
}

/// Hardware task start sequence; the master's output task is always last.
fn start_sequence(areas: usize, order: StartOrder) -> Vec<(usize, TaskKind)> {
    let slaves = 1..areas;
    let mut sequence = Vec::with_capacity(areas * 2);
    match order {
        StartOrder::InputsFirst => {
            sequence.extend(slaves.clone().map(|a| (a, TaskKind::Inputs)));
            sequence.push((0, TaskKind::Inputs));
            sequence.extend(slaves.map(|a| (a, TaskKind::Outputs)));
        }
        StartOrder::OutputsFirst => {
            sequence.extend(slaves.clone().map(|a| (a, TaskKind::Outputs)));
            sequence.extend(slaves.map(|a| (a, TaskKind::Inputs)));
            sequence.push((0, TaskKind::Inputs));
        }
    }
    sequence.push((0, TaskKind::Outputs));
    sequence
}

fn supervise(
    faults: &SyncQueue<StageFault>,
    first_error: &Mutex<Option<DaqError>>,
    handles: &[AbortHandle],
    backends: &[Arc<dyn HardwareBackend>],
) {
    while let Ok(fault) = faults.pop(None) {
        let StageFault { area, stage, error } = fault;
        let consolidated = error.into_aborted(area, stage);
        {
            let mut first = first_error.lock();
            if first.is_some() {
                debug!(area, %stage, error = %consolidated, "Secondary fault");
                continue;
            }
            error!(area, %stage, error = %consolidated, "Stage fault, aborting all areas");
            *first = Some(consolidated);
        }
        for handle in handles {
            handle.abort();
        }
        for backend in backends {
            if let Err(e) = backend.stop() {
                warn!(error = %e, "Backend stop failed");
            }
        }
    }
    debug!("Supervisor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_first_sequence() {
        let seq = start_sequence(3, StartOrder::InputsFirst);
        assert_eq!(
            seq,
            vec![
                (1, TaskKind::Inputs),
                (2, TaskKind::Inputs),
                (0, TaskKind::Inputs),
                (1, TaskKind::Outputs),
                (2, TaskKind::Outputs),
                (0, TaskKind::Outputs),
            ]
        );
    }

    #[test]
    fn test_outputs_first_sequence() {
        let seq = start_sequence(2, StartOrder::OutputsFirst);
        assert_eq!(
            seq,
            vec![
                (1, TaskKind::Outputs),
                (1, TaskKind::Inputs),
                (0, TaskKind::Inputs),
                (0, TaskKind::Outputs),
            ]
        );
    }

    #[test]
    fn test_single_area_sequence() {
        for order in [StartOrder::InputsFirst, StartOrder::OutputsFirst] {
            assert_eq!(
                start_sequence(1, order),
                vec![(0, TaskKind::Inputs), (0, TaskKind::Outputs)]
            );
        }
    }
}
