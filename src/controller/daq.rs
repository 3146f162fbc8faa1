//! Acquisition stage: programs the backend and turns its reads into [`DaqChunk`]s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::controller::{CancelToken, StageWorker, Step};
use crate::data::DaqChunk;
use crate::error::{AppResult, DaqError};
use crate::hardware::{ChannelSpec, ClockSpec, HardwareBackend};
use crate::limits::DEFAULT_POLL_INTERVAL;
use crate::queue::SyncQueue;
use crate::scanner::ScannerVector;

/// Instant the hardware tasks of a run finished starting.
///
/// The trigger timeout counts from this mark, so a slow multi-area start does
/// not eat into it. Shared by every Daq stage of a run.
#[derive(Debug, Clone, Default)]
pub struct TaskStartMark(Arc<Mutex<Option<Instant>>>);

impl TaskStartMark {
    /// Unset mark.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record now, unless already recorded.
    pub fn mark(&self) {
        self.0.lock().get_or_insert_with(Instant::now);
    }

    /// When the mark was recorded.
    pub fn get(&self) -> Option<Instant> {
        *self.0.lock()
    }
}

/// Daq stage worker for one area.
///
/// Owns the built [`ScannerVector`] for as long as its sequences are being
/// output. `prepare` configures outputs and inputs; tasks are started later
/// by the orchestrator.
pub struct DaqWorker {
    area: usize,
    backend: Arc<dyn HardwareBackend>,
    scanner: ScannerVector,
    clock: ClockSpec,
    channels: ChannelSpec,
    out: SyncQueue<DaqChunk>,
    poll_interval: Duration,
    trigger_timeout: Option<Duration>,
    sample_limit: Option<u64>,
    sequence: u64,
    next_sample: u64,
    tasks_started: TaskStartMark,
    shared_start: bool,
}

impl DaqWorker {
    /// Worker for a built scanner vector.
    pub fn new(
        backend: Arc<dyn HardwareBackend>,
        scanner: ScannerVector,
        clock: ClockSpec,
        channels: ChannelSpec,
        out: SyncQueue<DaqChunk>,
    ) -> Self {
        Self {
            area: scanner.area(),
            backend,
            scanner,
            clock,
            channels,
            out,
            poll_interval: DEFAULT_POLL_INTERVAL,
            trigger_timeout: None,
            sample_limit: None,
            sequence: 0,
            next_sample: 0,
            tasks_started: TaskStartMark::new(),
            shared_start: false,
        }
    }

    /// How long one `read_chunk` may block before cancellation is rechecked.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    /// Fail with `TriggerTimeout` if no data arrives within `timeout` of the
    /// task start (see [`with_task_start`](Self::with_task_start)).
    pub fn with_trigger_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.trigger_timeout = timeout;
        self
    }

    /// Count the trigger timeout from `mark` instead of from `prepare`.
    pub fn with_task_start(mut self, mark: TaskStartMark) -> Self {
        self.tasks_started = mark;
        self.shared_start = true;
        self
    }

    /// Stop after `cycles` complete output cycles.
    pub fn with_cycle_limit(mut self, cycles: Option<u64>) -> Self {
        self.sample_limit = cycles.and_then(|n| {
            self.scanner
                .layout()
                .map(|layout| n * layout.cycle_samples() as u64)
        });
        self
    }
}

impl StageWorker for DaqWorker {
    fn prepare(&mut self, _cancel: &CancelToken) -> AppResult<()> {
        let sequences = self.scanner.sequences().ok_or_else(|| {
            DaqError::HardwareFault(format!("area {} scanner vector not built", self.area))
        })?;
        self.backend.configure_outputs(sequences, &self.clock)?;
        self.backend.configure_inputs(&self.channels, &self.clock)?;
        if !self.shared_start {
            self.tasks_started.mark();
        }
        info!(
            backend = self.backend.name(),
            trigger = %self.clock.trigger,
            samples = sequences.len(),
            "Hardware configured, waiting for trigger"
        );
        Ok(())
    }

    fn step(&mut self, _cancel: &CancelToken) -> AppResult<Step> {
        if let Some(limit) = self.sample_limit {
            if self.next_sample >= limit {
                info!(chunks = self.sequence, "Acquisition limit reached");
                return Ok(Step::Finished);
            }
        }

        let mut block = match self.backend.read_chunk(self.poll_interval) {
            Ok(block) => block,
            Err(DaqError::Timeout) => {
                if self.sequence == 0 {
                    if let (Some(timeout), Some(started)) =
                        (self.trigger_timeout, self.tasks_started.get())
                    {
                        let waited = started.elapsed();
                        if waited >= timeout {
                            return Err(DaqError::TriggerTimeout {
                                area: self.area,
                                waited,
                            });
                        }
                    }
                } else {
                    trace!("Read timed out, polling again");
                }
                return Ok(Step::Continue);
            }
            Err(e) => return Err(e),
        };

        if let Some(limit) = self.sample_limit {
            let remaining = (limit - self.next_sample) as usize;
            if block.samples() > remaining {
                for channel in &mut block.channels {
                    channel.truncate(remaining);
                }
            }
        }

        let samples = block.samples();
        if samples == 0 {
            warn!("Backend returned an empty chunk");
            return Ok(Step::Continue);
        }
        let chunk = DaqChunk {
            area: self.area,
            sequence: self.sequence,
            first_sample: self.next_sample,
            channels: block.channels,
        };
        trace!(sequence = self.sequence, samples, "Chunk acquired");
        self.out.push(chunk, None)?;
        self.sequence += 1;
        self.next_sample += samples as u64;
        Ok(Step::Continue)
    }

    fn finish(&mut self, aborted: bool) {
        if let Err(e) = self.backend.stop() {
            warn!(error = %e, "Backend stop failed");
        }
        debug!(
            aborted,
            chunks = self.sequence,
            samples = self.next_sample,
            "Acquisition finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{StageController, StageKind, StageState};
    use crate::geometry::{ScanGeometry, ScanMode};
    use crate::hardware::mock::{EventLog, MockBackend, MockOptions, TriggerLine};
    use crate::hardware::{TaskKind, TriggerMode};
    use crate::timing::DeviceTiming;

    fn built_scanner() -> ScannerVector {
        let g = ScanGeometry::new();
        g.resolution_x.set(8).unwrap();
        g.resolution_y.set(4).unwrap();
        let mut sv = ScannerVector::new(0, ScanMode::Sawtooth);
        sv.build(&g, &DeviceTiming::default()).unwrap();
        sv
    }

    fn clock(trigger: TriggerMode) -> ClockSpec {
        ClockSpec {
            sample_rate_hz: 1e6,
            trigger,
        }
    }

    #[test]
    fn test_cycle_limit_emits_exact_samples() {
        let backend = Arc::new(MockBackend::new(
            0,
            5.0,
            MockOptions::default(),
            TriggerLine::new(),
            EventLog::new(),
        ));
        let sv = built_scanner();
        let cycle = sv.layout().unwrap().cycle_samples();
        let out = SyncQueue::new("daq", 64);
        let worker = DaqWorker::new(
            backend.clone(),
            sv,
            clock(TriggerMode::Master),
            ChannelSpec {
                channels: 1,
                chunk_samples: 50,
            },
            out.clone(),
        )
        .with_cycle_limit(Some(2));

        let ctl = StageController::new(0, StageKind::Daq, SyncQueue::new("faults", 4))
            .with_outbound(Arc::new(out.clone()));
        ctl.start(worker, Duration::from_secs(1)).unwrap();
        backend.start(TaskKind::Inputs).unwrap();
        backend.start(TaskKind::Outputs).unwrap();
        ctl.join();
        assert_eq!(ctl.state(), StageState::Idle);

        let mut total = 0;
        let mut expected_seq = 0;
        while let Ok(chunk) = out.pop(Some(Duration::from_millis(10))) {
            assert_eq!(chunk.sequence, expected_seq);
            assert_eq!(chunk.first_sample, total as u64);
            expected_seq += 1;
            total += chunk.samples();
        }
        assert_eq!(total, 2 * cycle);
    }

    #[test]
    fn test_trigger_timeout() {
        let backend = Arc::new(MockBackend::new(
            1,
            5.0,
            MockOptions::default(),
            TriggerLine::new(),
            EventLog::new(),
        ));
        let faults = SyncQueue::new("faults", 4);
        let out = SyncQueue::new("daq", 4);
        let worker = DaqWorker::new(
            backend.clone(),
            built_scanner(),
            clock(TriggerMode::External),
            ChannelSpec {
                channels: 1,
                chunk_samples: 16,
            },
            out.clone(),
        )
        .with_poll_interval(Duration::from_millis(5))
        .with_trigger_timeout(Some(Duration::from_millis(40)));

        let ctl = StageController::new(1, StageKind::Daq, faults.clone())
            .with_outbound(Arc::new(out));
        ctl.start(worker, Duration::from_secs(1)).unwrap();
        backend.start(TaskKind::Inputs).unwrap();
        ctl.join();

        let fault = faults.pop(Some(Duration::from_secs(1))).unwrap();
        assert!(matches!(
            fault.error,
            DaqError::TriggerTimeout { area: 1, .. }
        ));
    }

    #[test]
    fn test_trigger_timeout_counts_from_task_start() {
        let backend = Arc::new(MockBackend::new(
            1,
            5.0,
            MockOptions::default(),
            TriggerLine::new(),
            EventLog::new(),
        ));
        let faults = SyncQueue::new("faults", 4);
        let out = SyncQueue::new("daq", 4);
        let mark = TaskStartMark::new();
        let worker = DaqWorker::new(
            backend.clone(),
            built_scanner(),
            clock(TriggerMode::External),
            ChannelSpec {
                channels: 1,
                chunk_samples: 16,
            },
            out.clone(),
        )
        .with_poll_interval(Duration::from_millis(5))
        .with_trigger_timeout(Some(Duration::from_millis(40)))
        .with_task_start(mark.clone());

        let ctl = StageController::new(1, StageKind::Daq, faults.clone())
            .with_outbound(Arc::new(out));
        ctl.start(worker, Duration::from_secs(1)).unwrap();
        backend.start(TaskKind::Inputs).unwrap();

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(ctl.state(), StageState::Running);
        assert!(faults.is_empty());

        mark.mark();
        ctl.join();
        let fault = faults.pop(Some(Duration::from_secs(1))).unwrap();
        match fault.error {
            DaqError::TriggerTimeout { area, waited } => {
                assert_eq!(area, 1);
                assert!(waited < Duration::from_millis(140));
            }
            other => panic!("unexpected fault {other}"),
        }
    }
}
