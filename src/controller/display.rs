//! Display stage: hands assembled images to the live-view sink.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::controller::{CancelToken, StageWorker, Step};
use crate::data::SharedImage;
use crate::error::{AppResult, DaqError};
use crate::limits::DEFAULT_POLL_INTERVAL;
use crate::queue::SyncQueue;
use crate::sink::DisplaySink;

/// Display stage worker for one area.
///
/// A failing display never stops the acquisition; the error is logged and
/// the next frame is tried.
pub struct DisplayWorker {
    input: SyncQueue<SharedImage>,
    sink: Arc<dyn DisplaySink>,
    poll_interval: Duration,
    shown: u64,
    failed: u64,
}

impl DisplayWorker {
    /// Worker feeding `sink` from `input`.
    pub fn new(input: SyncQueue<SharedImage>, sink: Arc<dyn DisplaySink>) -> Self {
        Self {
            input,
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shown: 0,
            failed: 0,
        }
    }

    /// How long one `pop` may block before cancellation is rechecked.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }
}

impl StageWorker for DisplayWorker {
    fn step(&mut self, _cancel: &CancelToken) -> AppResult<Step> {
        let image = match self.input.pop(Some(self.poll_interval)) {
            Ok(image) => image,
            Err(DaqError::Timeout) => return Ok(Step::Continue),
            Err(e) => return Err(e),
        };
        match self.sink.publish(image) {
            Ok(()) => self.shown += 1,
            Err(e) => {
                self.failed += 1;
                warn!(error = %e, "Display sink rejected frame");
            }
        }
        Ok(Step::Continue)
    }

    fn finish(&mut self, aborted: bool) {
        debug!(aborted, shown = self.shown, failed = self.failed, "Display finished");
    }
}
