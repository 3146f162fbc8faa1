//! Storage stage: hands every assembled image to the storage sink.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::controller::{CancelToken, StageWorker, Step};
use crate::data::SharedImage;
use crate::error::{AppResult, DaqError};
use crate::limits::DEFAULT_POLL_INTERVAL;
use crate::queue::SyncQueue;
use crate::sink::StorageSink;

/// Storage stage worker for one area.
///
/// A storage failure is a stage fault: the orchestrator aborts the run, and
/// frames stored before the fault are kept. Stop and abort do not cut the
/// queue short: every frame already queued is written before the flush.
pub struct StorageWorker {
    input: SyncQueue<SharedImage>,
    sink: Arc<dyn StorageSink>,
    poll_interval: Duration,
    stored: u64,
}

impl StorageWorker {
    /// Worker feeding `sink` from `input`.
    pub fn new(input: SyncQueue<SharedImage>, sink: Arc<dyn StorageSink>) -> Self {
        Self {
            input,
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stored: 0,
        }
    }

    /// How long one `pop` may block before cancellation is rechecked.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }
}

impl StageWorker for StorageWorker {
    fn step(&mut self, cancel: &CancelToken) -> AppResult<Step> {
        let image = match self.input.pop(Some(self.poll_interval)) {
            Ok(image) => image,
            Err(DaqError::Timeout) if cancel.is_cancelled() => return Ok(Step::Finished),
            Err(DaqError::Timeout) => return Ok(Step::Continue),
            Err(e) => return Err(e),
        };
        self.sink.publish(image)?;
        self.stored += 1;
        Ok(Step::Continue)
    }

    fn drains_on_cancel(&self) -> bool {
        true
    }

    fn finish(&mut self, aborted: bool) {
        if let Err(e) = self.sink.flush() {
            error!(error = %e, "Storage flush failed");
        }
        if aborted {
            info!(stored = self.stored, "Storage stopped by abort, stored frames kept");
        } else {
            debug!(stored = self.stored, "Storage finished");
        }
    }
}
