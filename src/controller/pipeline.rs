//! Assembly stage: folds raw chunks into images and fans them out.
//!
//! Each input sample is looked up in a per-frame table built from the scanner
//! vector's sample → pixel map; pixels are the mean of their samples. Lead,
//! trail and padding samples are skipped, so the image is always
//! `width × height` however long the raw line is.
//!
//! Storage never loses a frame: its `push` blocks. Display follows
//! [`DisplayPolicy`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::controller::{CancelToken, StageWorker, Step};
use crate::data::{AssembledImage, DaqChunk, ScanMetadata, SharedImage};
use crate::error::{AppResult, DaqError};
use crate::limits::DEFAULT_POLL_INTERVAL;
use crate::queue::SyncQueue;
use crate::scanner::FrameLayout;

/// What the pipeline does when the display queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisplayPolicy {
    /// Evict the oldest queued frame so the newest is always shown
    #[default]
    DropOldest,
    /// Wait for the display, like storage
    Block,
}

const NOT_IMAGED: u32 = u32::MAX;

struct FrameAccumulator {
    index: u64,
    sums: Vec<Vec<u64>>,
    filled: usize,
}

/// Pipeline stage worker for one area.
pub struct PipelineWorker {
    area: usize,
    layout: FrameLayout,
    metadata: Arc<ScanMetadata>,
    input: SyncQueue<DaqChunk>,
    storage: Option<SyncQueue<SharedImage>>,
    display: Option<SyncQueue<SharedImage>>,
    display_policy: DisplayPolicy,
    poll_interval: Duration,
    /// Pixel index for each sample of one frame, `NOT_IMAGED` outside pixels.
    pixel_of_sample: Vec<u32>,
    frame: Option<FrameAccumulator>,
    next_chunk: u64,
    next_sample: u64,
    published: u64,
    dropped_display: u64,
}

impl PipelineWorker {
    /// Worker assembling frames of `layout`.
    pub fn new(
        area: usize,
        layout: FrameLayout,
        metadata: Arc<ScanMetadata>,
        input: SyncQueue<DaqChunk>,
    ) -> Self {
        let pixel_of_sample = (0..layout.frame_samples())
            .map(|s| match layout.sample_to_pixel(s) {
                Some(p) => p.y * layout.width + p.x,
                None => NOT_IMAGED,
            })
            .collect();
        Self {
            area,
            layout,
            metadata,
            input,
            storage: None,
            display: None,
            display_policy: DisplayPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            pixel_of_sample,
            frame: None,
            next_chunk: 0,
            next_sample: 0,
            published: 0,
            dropped_display: 0,
        }
    }

    /// Send every frame to storage.
    pub fn with_storage(mut self, queue: SyncQueue<SharedImage>) -> Self {
        self.storage = Some(queue);
        self
    }

    /// Send frames to display under `policy`.
    pub fn with_display(mut self, queue: SyncQueue<SharedImage>, policy: DisplayPolicy) -> Self {
        self.display = Some(queue);
        self.display_policy = policy;
        self
    }

    /// How long one `pop` may block before cancellation is rechecked.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    fn accumulate(&mut self, chunk: &DaqChunk) -> AppResult<()> {
        let frame_samples = self.layout.frame_samples() as u64;
        let pixels = self.layout.pixels_per_frame();
        let channels = chunk.channel_count();

        for k in 0..chunk.samples() {
            let abs = chunk.first_sample + k as u64;
            let frame_index = abs / frame_samples;

            if self.frame.as_ref().is_some_and(|f| f.index != frame_index) {
                if let Some(partial) = self.frame.take() {
                    warn!(
                        frame = partial.index,
                        filled = partial.filled,
                        "Discarding incomplete frame"
                    );
                }
            }
            let frame = self.frame.get_or_insert_with(|| FrameAccumulator {
                index: frame_index,
                sums: vec![vec![0; pixels]; channels],
                filled: 0,
            });

            let offset = (abs % frame_samples) as usize;
            let pixel = self.pixel_of_sample[offset];
            if pixel != NOT_IMAGED {
                for (sums, samples) in frame.sums.iter_mut().zip(&chunk.channels) {
                    sums[pixel as usize] += u64::from(samples[k]);
                }
                frame.filled += 1;
            }

            if offset as u64 == frame_samples - 1 {
                if let Some(done) = self.frame.take() {
                    self.publish(done)?;
                }
            }
        }
        Ok(())
    }

    fn publish(&mut self, frame: FrameAccumulator) -> AppResult<()> {
        let spp = u64::from(self.layout.samples_per_pixel);
        let complete = frame.filled as u64 == self.layout.pixels_per_frame() as u64 * spp;
        if !complete {
            warn!(frame = frame.index, "Discarding incomplete frame");
            return Ok(());
        }

        let channels = frame
            .sums
            .into_iter()
            .map(|sums| {
                sums.into_iter()
                    .map(|s| ((s + spp / 2) / spp) as u16)
                    .collect()
            })
            .collect();
        let image: SharedImage = Arc::new(AssembledImage {
            area: self.area,
            sequence: frame.index,
            plane: (frame.index % u64::from(self.layout.planes)) as u32,
            width: self.layout.width,
            height: self.layout.height,
            channels,
            acquired_at: Utc::now(),
            metadata: Arc::clone(&self.metadata),
        });

        if let Some(display) = &self.display {
            match self.display_policy {
                DisplayPolicy::DropOldest => {
                    if let Some(old) = display.push_drop_oldest(Arc::clone(&image))? {
                        self.dropped_display += 1;
                        trace!(dropped = old.sequence, "Display lagging, dropped oldest frame");
                    }
                }
                DisplayPolicy::Block => display.push(Arc::clone(&image), None)?,
            }
        }
        if let Some(storage) = &self.storage {
            storage.push(image, None)?;
        }

        self.published += 1;
        trace!(sequence = frame.index, "Frame published");
        Ok(())
    }
}

impl StageWorker for PipelineWorker {
    fn step(&mut self, _cancel: &CancelToken) -> AppResult<Step> {
        let chunk = match self.input.pop(Some(self.poll_interval)) {
            Ok(chunk) => chunk,
            Err(DaqError::Timeout) => return Ok(Step::Continue),
            Err(e) => return Err(e),
        };

        if chunk.sequence != self.next_chunk || chunk.first_sample != self.next_sample {
            warn!(
                expected = self.next_chunk,
                got = chunk.sequence,
                "Chunk sequence gap"
            );
        }
        self.next_chunk = chunk.sequence + 1;
        self.next_sample = chunk.first_sample + chunk.samples() as u64;

        self.accumulate(&chunk)?;
        Ok(Step::Continue)
    }

    fn finish(&mut self, aborted: bool) {
        if let Some(partial) = self.frame.take() {
            debug!(frame = partial.index, "Dropping in-progress frame");
        }
        debug!(
            aborted,
            published = self.published,
            dropped_display = self.dropped_display,
            "Assembly finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ScanGeometry, ScanMode};
    use crate::scanner::ScannerVector;
    use crate::timing::DeviceTiming;
    use uuid::Uuid;

    fn layout(mode: ScanMode) -> FrameLayout {
        let g = ScanGeometry::new();
        g.mode.set(mode).unwrap();
        g.resolution_x.set(4).unwrap();
        g.resolution_y.set(3).unwrap();
        g.pixel_time_us.set(2.0).unwrap();
        let mut sv = ScannerVector::new(0, mode);
        sv.build(&g, &DeviceTiming::default()).unwrap();
        sv.layout().unwrap().clone()
    }

    fn metadata(layout: &FrameLayout) -> Arc<ScanMetadata> {
        Arc::new(ScanMetadata::new(
            Uuid::new_v4(),
            0,
            "test",
            Default::default(),
            layout,
        ))
    }

    /// Chunk whose value at each sample encodes the pixel it belongs to.
    fn encoded_chunk(layout: &FrameLayout, sequence: u64, first: u64, len: usize) -> DaqChunk {
        let frame = layout.frame_samples() as u64;
        let values = (0..len as u64)
            .map(|k| {
                let s = ((first + k) % frame) as usize;
                match layout.sample_to_pixel(s) {
                    Some(p) => (100 + p.y * 10 + p.x) as u16,
                    None => 9999,
                }
            })
            .collect();
        DaqChunk {
            area: 0,
            sequence,
            first_sample: first,
            channels: vec![values],
        }
    }

    #[test]
    fn test_assembles_full_frames_from_odd_sized_chunks() {
        for mode in [ScanMode::Sawtooth, ScanMode::Bidirectional] {
            let layout = layout(mode);
            let input = SyncQueue::new("in", 64);
            let storage = SyncQueue::new("storage", 8);
            let mut worker = PipelineWorker::new(0, layout.clone(), metadata(&layout), input.clone())
                .with_storage(storage.clone());

            let total = 2 * layout.frame_samples() as u64;
            let mut first = 0;
            let mut seq = 0;
            while first < total {
                let len = 7.min((total - first) as usize);
                input.push(encoded_chunk(&layout, seq, first, len), None).unwrap();
                first += len as u64;
                seq += 1;
            }
            while !input.is_empty() {
                worker.step(&CancelToken::new()).unwrap();
            }

            for expected in 0..2 {
                let image = storage.try_pop().unwrap();
                assert_eq!(image.sequence, expected);
                assert_eq!(image.channels[0].len(), 12);
                for y in 0..3 {
                    for x in 0..4 {
                        assert_eq!(image.get(0, x, y), Some((100 + y * 10 + x) as u16));
                    }
                }
            }
            assert!(storage.try_pop().is_none());
        }
    }

    #[test]
    fn test_display_drop_oldest_never_blocks() {
        let layout = layout(ScanMode::Sawtooth);
        let input = SyncQueue::new("in", 64);
        let storage = SyncQueue::new("storage", 8);
        let display = SyncQueue::new("display", 1);
        let mut worker = PipelineWorker::new(0, layout.clone(), metadata(&layout), input.clone())
            .with_storage(storage.clone())
            .with_display(display.clone(), DisplayPolicy::DropOldest);

        let frame = layout.frame_samples();
        for i in 0..3u64 {
            input
                .push(encoded_chunk(&layout, i, i * frame as u64, frame), None)
                .unwrap();
        }
        for _ in 0..3 {
            worker.step(&CancelToken::new()).unwrap();
        }
        assert_eq!(storage.len(), 3);
        assert_eq!(display.len(), 1);
        assert_eq!(display.try_pop().map(|i| i.sequence), Some(2));
        assert_eq!(worker.dropped_display, 2);
    }

    #[test]
    fn test_gap_discards_incomplete_frame() {
        let layout = layout(ScanMode::Sawtooth);
        let frame = layout.frame_samples() as u64;
        let input = SyncQueue::new("in", 8);
        let storage = SyncQueue::new("storage", 8);
        let mut worker = PipelineWorker::new(0, layout.clone(), metadata(&layout), input.clone())
            .with_storage(storage.clone());

        // first half of frame 0, then all of frame 1
        input.push(encoded_chunk(&layout, 0, 0, (frame / 2) as usize), None).unwrap();
        input.push(encoded_chunk(&layout, 2, frame, frame as usize), None).unwrap();
        worker.step(&CancelToken::new()).unwrap();
        worker.step(&CancelToken::new()).unwrap();

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.try_pop().map(|i| i.sequence), Some(1));
    }

    #[test]
    fn test_long_pixel_time_does_not_overflow_sums() {
        let g = ScanGeometry::new();
        g.resolution_x.set(1).unwrap();
        g.resolution_y.set(1).unwrap();
        g.retrace_fraction.set(0.0).unwrap();
        g.pixel_time_us.set(10_000.0).unwrap();
        let timing = DeviceTiming {
            sample_rate_hz: 10_000_000.0,
            ..DeviceTiming::default()
        };
        let mut sv = ScannerVector::new(0, ScanMode::Sawtooth);
        sv.build(&g, &timing).unwrap();
        let layout = sv.layout().unwrap().clone();
        assert_eq!(layout.samples_per_pixel, 100_000);

        let input = SyncQueue::new("in", 4);
        let storage = SyncQueue::new("storage", 4);
        let mut worker = PipelineWorker::new(0, layout.clone(), metadata(&layout), input.clone())
            .with_storage(storage.clone());
        let chunk = DaqChunk {
            area: 0,
            sequence: 0,
            first_sample: 0,
            channels: vec![vec![60_000; layout.frame_samples()]],
        };
        input.push(chunk, None).unwrap();
        worker.step(&CancelToken::new()).unwrap();

        let image = storage.try_pop().unwrap();
        assert_eq!(image.get(0, 0, 0), Some(60_000));
    }

    #[test]
    fn test_closed_input_is_end_of_stream() {
        let layout = layout(ScanMode::Sawtooth);
        let input: SyncQueue<DaqChunk> = SyncQueue::new("in", 1);
        let mut worker = PipelineWorker::new(0, layout.clone(), metadata(&layout), input.clone());
        crate::queue::Closable::close(&input);
        let err = worker.step(&CancelToken::new()).unwrap_err();
        assert!(err.is_end_of_stream());
    }
}
