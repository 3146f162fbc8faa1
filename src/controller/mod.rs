//! Stage controllers: one cancellable worker thread per stage per area.
//!
//! ```text
//!            start()            worker reached loop          stop() / upstream closed
//!   Idle ───────────► Starting ────────────────────► Running ───────────────► Stopping ──► Idle
//!                        │                              │
//!                        │ prepare failed               │ abort() or step error
//!                        └──────────────► Aborting ◄────┘
//!                                            │
//!                                            └──────────────────────────────────────────► Idle
//! ```
//!
//! `start` is a rendezvous: it returns only when the worker has finished
//! `prepare` and entered its loop, or fails with `StartFailed`. The worker
//! checks the cancellation flag between units of work; `abort` also closes the
//! controller's queues so a worker blocked in `push`/`pop` wakes up. A worker
//! that drains on cancel (storage) keeps consuming its closed inbound queue
//! until it is empty, so frames already handed to it are never lost. On exit
//! the worker always closes its outbound queues so end of stream cascades
//! downstream.
//!
//! Runtime failures are not returned from the thread; they are posted as a
//! [`StageFault`] to the orchestrator's fault queue.

pub mod daq;
pub mod display;
pub mod pipeline;
pub mod storage;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, info_span, warn};

use crate::error::{AppResult, DaqError};
use crate::limits::FAULT_PUSH_TIMEOUT;
use crate::queue::{Closable, SyncQueue};

pub use daq::{DaqWorker, TaskStartMark};
pub use display::DisplayWorker;
pub use pipeline::{DisplayPolicy, PipelineWorker};
pub use storage::StorageWorker;

/// Pipeline stage a controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Hardware acquisition
    Daq,
    /// Image assembly and fan-out
    Pipeline,
    /// Live view
    Display,
    /// Persistence
    Storage,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Daq => "daq",
            StageKind::Pipeline => "pipeline",
            StageKind::Display => "display",
            StageKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a stage controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageState {
    /// No worker thread
    Idle,
    /// Worker spawned, preparing
    Starting,
    /// Worker in its loop
    Running,
    /// Worker finishing after a cooperative stop or end of stream
    Stopping,
    /// Worker unwinding after abort or error
    Aborting,
}

/// Cancellation flags shared between a controller and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once stop or abort was requested.
    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.is_aborted()
    }

    /// True once abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    fn reset(&self) {
        self.stop.store(false, Ordering::Release);
        self.abort.store(false, Ordering::Release);
    }
}

/// Result of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work may follow
    Continue,
    /// The worker is done (e.g. frame limit reached)
    Finished,
}

/// Work run on a stage thread.
pub trait StageWorker: Send + 'static {
    /// One-time setup before the controller reports `Running`.
    fn prepare(&mut self, _cancel: &CancelToken) -> AppResult<()> {
        Ok(())
    }

    /// Process one unit (one chunk, one image).
    ///
    /// [`DaqError::Closed`] means the upstream queue ended and stops the loop normally.
    fn step(&mut self, cancel: &CancelToken) -> AppResult<Step>;

    /// Keep stepping after stop or abort until `step` ends the loop itself.
    ///
    /// A draining worker must return [`Step::Finished`] or end of stream once
    /// its input is exhausted.
    fn drains_on_cancel(&self) -> bool {
        false
    }

    /// Release resources. Runs on every exit path.
    fn finish(&mut self, _aborted: bool) {}
}

/// Runtime failure reported by a stage thread.
#[derive(Debug)]
pub struct StageFault {
    /// Area of the failing stage
    pub area: usize,
    /// Failing stage
    pub stage: StageKind,
    /// What went wrong
    pub error: DaqError,
}

struct StateCell {
    state: Mutex<StageState>,
    changed: Condvar,
    start_error: Mutex<Option<String>>,
    /// Set once the current run reached `Running`, even if it already exited.
    reached_running: AtomicBool,
}

impl StateCell {
    fn new() -> Self {
        Self {
            state: Mutex::new(StageState::Idle),
            changed: Condvar::new(),
            start_error: Mutex::new(None),
            reached_running: AtomicBool::new(false),
        }
    }

    fn get(&self) -> StageState {
        *self.state.lock()
    }

    fn set(&self, next: StageState, area: usize, stage: StageKind) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(area, %stage, from = ?*state, to = ?next, "Stage transition");
            *state = next;
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// Cloneable handle that aborts one controller from another thread.
#[derive(Clone)]
pub struct AbortHandle {
    area: usize,
    stage: StageKind,
    cancel: CancelToken,
    queues: Arc<Vec<Arc<dyn Closable>>>,
    cell: Arc<StateCell>,
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("area", &self.area)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl AbortHandle {
    /// Set the abort flag and close every queue the worker touches.
    pub fn abort(&self) {
        self.cancel.request_abort();
        {
            let mut state = self.cell.state.lock();
            if *state == StageState::Running || *state == StageState::Stopping {
                *state = StageState::Aborting;
            }
        }
        self.cell.changed.notify_all();
        for queue in self.queues.iter() {
            queue.close();
        }
    }

    /// Area of the controller.
    pub fn area(&self) -> usize {
        self.area
    }

    /// Stage of the controller.
    pub fn stage(&self) -> StageKind {
        self.stage
    }
}

/// Owns one stage thread.
pub struct StageController {
    area: usize,
    stage: StageKind,
    cancel: CancelToken,
    inbound: Vec<Arc<dyn Closable>>,
    outbound: Vec<Arc<dyn Closable>>,
    cell: Arc<StateCell>,
    faults: SyncQueue<StageFault>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for StageController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageController")
            .field("area", &self.area)
            .field("stage", &self.stage)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StageController {
    /// Controller for `stage` of `area`, reporting runtime faults to `faults`.
    pub fn new(area: usize, stage: StageKind, faults: SyncQueue<StageFault>) -> Self {
        Self {
            area,
            stage,
            cancel: CancelToken::new(),
            inbound: Vec::new(),
            outbound: Vec::new(),
            cell: Arc::new(StateCell::new()),
            faults,
            handle: Mutex::new(None),
        }
    }

    /// Register a queue the worker pops from; closed on abort.
    pub fn with_inbound(mut self, queue: Arc<dyn Closable>) -> Self {
        self.inbound.push(queue);
        self
    }

    /// Register a queue the worker pushes to; closed whenever the worker exits.
    pub fn with_outbound(mut self, queue: Arc<dyn Closable>) -> Self {
        self.outbound.push(queue);
        self
    }

    /// Area index.
    pub fn area(&self) -> usize {
        self.area
    }

    /// Stage kind.
    pub fn stage(&self) -> StageKind {
        self.stage
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StageState {
        self.cell.get()
    }

    /// Spawn the worker and wait until it is `Running`.
    ///
    /// # Errors
    ///
    /// [`DaqError::StartFailed`] if the controller is not idle, the thread
    /// cannot be spawned, `prepare` fails, or `Running` is not reached within
    /// `timeout`.
    pub fn start<W: StageWorker>(&self, mut worker: W, timeout: Duration) -> AppResult<()> {
        {
            let mut state = self.cell.state.lock();
            if *state != StageState::Idle {
                return Err(self.start_failed(format!("controller is {:?}, not Idle", *state)));
            }
            *state = StageState::Starting;
        }
        *self.cell.start_error.lock() = None;
        self.cell.reached_running.store(false, Ordering::Release);
        self.cancel.reset();

        let area = self.area;
        let stage = self.stage;
        let cancel = self.cancel.clone();
        let cell = Arc::clone(&self.cell);
        let outbound = self.outbound.clone();
        let faults = self.faults.clone();

        let spawned = thread::Builder::new()
            .name(format!("area{}-{}", area, stage))
            .spawn(move || {
                let span = info_span!("stage", area, %stage);
                let _entered = span.enter();
                run_worker(&mut worker, area, stage, &cancel, &cell, &faults);
                for queue in &outbound {
                    queue.close();
                }
                cell.set(StageState::Idle, area, stage);
            });

        match spawned {
            Ok(handle) => *self.handle.lock() = Some(handle),
            Err(e) => {
                self.cell.set(StageState::Idle, area, stage);
                return Err(self.start_failed(format!("cannot spawn thread: {}", e)));
            }
        }

        self.wait_running(timeout)
    }

    fn wait_running(&self, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.cell.state.lock();
        while *state == StageState::Starting {
            if self.cell.changed.wait_until(&mut state, deadline).timed_out()
                && *state == StageState::Starting
            {
                return Err(self.start_failed(format!(
                    "did not reach Running within {:?}",
                    timeout
                )));
            }
        }
        match *state {
            _ if self.cell.reached_running.load(Ordering::Acquire) => {
                info!(area = self.area, stage = %self.stage, "Stage running");
                Ok(())
            }
            other => {
                drop(state);
                let reason = self
                    .cell
                    .start_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| format!("worker exited while {:?}", other));
                Err(self.start_failed(reason))
            }
        }
    }

    fn start_failed(&self, reason: String) -> DaqError {
        DaqError::StartFailed {
            area: self.area,
            stage: self.stage,
            reason,
        }
    }

    /// Ask the worker to finish its current unit and exit.
    pub fn stop(&self) {
        debug!(area = self.area, stage = %self.stage, "Stop requested");
        self.cancel.request_stop();
    }

    /// Abort immediately: set the flag and close all registered queues.
    pub fn abort(&self) {
        self.abort_handle().abort();
    }

    /// Handle for aborting from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        let mut queues = self.inbound.clone();
        queues.extend(self.outbound.iter().cloned());
        AbortHandle {
            area: self.area,
            stage: self.stage,
            cancel: self.cancel.clone(),
            queues: Arc::new(queues),
            cell: Arc::clone(&self.cell),
        }
    }

    /// Wait for the worker thread to exit.
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(area = self.area, stage = %self.stage, "Stage thread panicked");
            }
        }
    }
}

impl Drop for StageController {
    fn drop(&mut self) {
        if self.handle.get_mut().is_some() {
            self.abort();
            self.join();
        }
    }
}

fn run_worker<W: StageWorker>(
    worker: &mut W,
    area: usize,
    stage: StageKind,
    cancel: &CancelToken,
    cell: &StateCell,
    faults: &SyncQueue<StageFault>,
) {
    if let Err(e) = worker.prepare(cancel) {
        warn!(error = %e, "Stage failed to prepare");
        *cell.start_error.lock() = Some(e.to_string());
        cell.set(StageState::Aborting, area, stage);
        worker.finish(true);
        return;
    }

    if cancel.is_aborted() {
        cell.set(StageState::Aborting, area, stage);
        worker.finish(true);
        return;
    }
    cell.reached_running.store(true, Ordering::Release);
    cell.set(StageState::Running, area, stage);

    let mut fault = None;
    while worker.drains_on_cancel() || !cancel.is_cancelled() {
        match worker.step(cancel) {
            Ok(Step::Continue) => {}
            Ok(Step::Finished) => break,
            Err(e) if e.is_end_of_stream() => {
                debug!("Upstream closed");
                break;
            }
            Err(e) => {
                fault = Some(e);
                break;
            }
        }
    }

    let aborted = fault.is_some() || cancel.is_aborted();
    cell.set(
        if aborted {
            StageState::Aborting
        } else {
            StageState::Stopping
        },
        area,
        stage,
    );
    worker.finish(aborted);

    if let Some(error) = fault {
        error!(error = %error, "Stage failed");
        let report = StageFault { area, stage, error };
        if let Err(e) = faults.push(report, Some(FAULT_PUSH_TIMEOUT)) {
            let lost = e.into_inner();
            error!(error = %lost.error, "Fault queue unavailable, fault not reported");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        steps: Arc<AtomicUsize>,
        limit: Option<usize>,
        fail_prepare: bool,
        fail_at: Option<usize>,
        prepare_delay: Duration,
    }

    impl Counter {
        fn new(steps: Arc<AtomicUsize>) -> Self {
            Self {
                steps,
                limit: None,
                fail_prepare: false,
                fail_at: None,
                prepare_delay: Duration::ZERO,
            }
        }
    }

    impl StageWorker for Counter {
        fn prepare(&mut self, _cancel: &CancelToken) -> AppResult<()> {
            thread::sleep(self.prepare_delay);
            if self.fail_prepare {
                return Err(DaqError::HardwareFault("no device".into()));
            }
            Ok(())
        }

        fn step(&mut self, _cancel: &CancelToken) -> AppResult<Step> {
            let n = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.fail_at {
                return Err(DaqError::HardwareFault("boom".into()));
            }
            thread::sleep(Duration::from_millis(1));
            Ok(if Some(n) == self.limit {
                Step::Finished
            } else {
                Step::Continue
            })
        }
    }

    fn faults() -> SyncQueue<StageFault> {
        SyncQueue::new("faults", 8)
    }

    #[test]
    fn test_start_is_rendezvous_and_stop_returns_to_idle() {
        let steps = Arc::new(AtomicUsize::new(0));
        let ctl = StageController::new(0, StageKind::Pipeline, faults());
        ctl.start(Counter::new(steps.clone()), Duration::from_secs(1))
            .unwrap();
        assert!(matches!(
            ctl.state(),
            StageState::Running
        ));
        ctl.stop();
        ctl.join();
        assert_eq!(ctl.state(), StageState::Idle);
        assert!(steps.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_prepare_failure_is_start_failed() {
        let mut worker = Counter::new(Arc::new(AtomicUsize::new(0)));
        worker.fail_prepare = true;
        let ctl = StageController::new(2, StageKind::Daq, faults());
        let err = ctl.start(worker, Duration::from_secs(1)).unwrap_err();
        match err {
            DaqError::StartFailed { area, stage, reason } => {
                assert_eq!(area, 2);
                assert_eq!(stage, StageKind::Daq);
                assert!(reason.contains("no device"));
            }
            other => panic!("unexpected {:?}", other),
        }
        ctl.join();
        assert_eq!(ctl.state(), StageState::Idle);
    }

    #[test]
    fn test_slow_prepare_times_out() {
        let mut worker = Counter::new(Arc::new(AtomicUsize::new(0)));
        worker.prepare_delay = Duration::from_millis(300);
        let ctl = StageController::new(1, StageKind::Daq, faults());
        let err = ctl.start(worker, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, DaqError::StartFailed { .. }));
        ctl.abort();
        ctl.join();
        assert_eq!(ctl.state(), StageState::Idle);
    }

    #[test]
    fn test_step_error_reported_as_fault_and_closes_outbound() {
        let q = faults();
        let out: SyncQueue<u32> = SyncQueue::new("out", 1);
        let mut worker = Counter::new(Arc::new(AtomicUsize::new(0)));
        worker.fail_at = Some(3);
        let ctl = StageController::new(0, StageKind::Daq, q.clone())
            .with_outbound(Arc::new(out.clone()));
        ctl.start(worker, Duration::from_secs(1)).unwrap();
        ctl.join();

        let fault = q.pop(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(fault.stage, StageKind::Daq);
        assert!(matches!(fault.error, DaqError::HardwareFault(_)));
        assert!(out.is_closed());
    }

    #[test]
    fn test_finished_worker_exits_cleanly() {
        let q = faults();
        let mut worker = Counter::new(Arc::new(AtomicUsize::new(0)));
        worker.limit = Some(5);
        let ctl = StageController::new(0, StageKind::Storage, q.clone());
        ctl.start(worker, Duration::from_secs(1)).unwrap();
        ctl.join();
        assert!(q.is_empty());
        assert!(ctl.start(Counter::new(Arc::new(AtomicUsize::new(0))), Duration::from_secs(1)).is_ok());
        ctl.stop();
        ctl.join();
    }

    #[test]
    fn test_abort_unblocks_worker_waiting_on_queue() {
        struct Consumer(SyncQueue<u8>);
        impl StageWorker for Consumer {
            fn step(&mut self, _cancel: &CancelToken) -> AppResult<Step> {
                self.0.pop(None)?;
                Ok(Step::Continue)
            }
        }
        let input: SyncQueue<u8> = SyncQueue::new("in", 1);
        let ctl = StageController::new(0, StageKind::Display, faults())
            .with_inbound(Arc::new(input.clone()));
        ctl.start(Consumer(input), Duration::from_secs(1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        ctl.abort();
        ctl.join();
        assert_eq!(ctl.state(), StageState::Idle);
    }
}
