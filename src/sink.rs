//! Display and storage consumers of assembled images.
//!
//! Both sinks receive the same [`SharedImage`]; neither may mutate it.
//! `StorageSink::publish` returns only once the image is stored, which is
//! what makes a slow disk stall the pipeline instead of losing frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::data::SharedImage;
use crate::error::AppResult;

/// Live-view consumer.
pub trait DisplaySink: Send + Sync {
    /// Show an image. Called from the area's display thread.
    fn publish(&self, image: SharedImage) -> AppResult<()>;
}

/// Persistent consumer. Must never drop an image it acknowledged.
pub trait StorageSink: Send + Sync {
    /// Store an image; returns once it is stored.
    fn publish(&self, image: SharedImage) -> AppResult<()>;

    /// Flush buffered images at end of acquisition.
    fn flush(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Keeps every published image in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    images: Mutex<Vec<SharedImage>>,
    write_delay: Option<Duration>,
    flushed: AtomicU64,
}

impl MemoryStorage {
    /// Storage that accepts images immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that takes `delay` per image, like a slow disk.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Stored images in arrival order.
    pub fn images(&self) -> Vec<SharedImage> {
        self.images.lock().clone()
    }

    /// Number of stored images.
    pub fn len(&self) -> usize {
        self.images.lock().len()
    }

    /// True if nothing was stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `flush` ran.
    pub fn flush_count(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }
}

impl StorageSink for MemoryStorage {
    fn publish(&self, image: SharedImage) -> AppResult<()> {
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        self.images.lock().push(image);
        Ok(())
    }

    fn flush(&self) -> AppResult<()> {
        self.flushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Publishes the newest image on a watch channel for a GUI thread.
#[derive(Debug)]
pub struct LatestFrameDisplay {
    tx: watch::Sender<Option<SharedImage>>,
    shown: AtomicU64,
}

impl Default for LatestFrameDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrameDisplay {
    /// Display with no image yet.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            shown: AtomicU64::new(0),
        }
    }

    /// Receiver that always holds the newest image.
    pub fn subscribe(&self) -> watch::Receiver<Option<SharedImage>> {
        self.tx.subscribe()
    }

    /// Newest image, if any.
    pub fn latest(&self) -> Option<SharedImage> {
        self.tx.borrow().clone()
    }

    /// Images shown so far.
    pub fn shown(&self) -> u64 {
        self.shown.load(Ordering::Relaxed)
    }
}

impl DisplaySink for LatestFrameDisplay {
    fn publish(&self, image: SharedImage) -> AppResult<()> {
        trace!(area = image.area, sequence = image.sequence, "Display frame");
        self.tx.send_replace(Some(image));
        self.shown.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AssembledImage, ScanMetadata};
    use crate::geometry::GeometrySnapshot;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    fn image(sequence: u64) -> SharedImage {
        Arc::new(AssembledImage {
            area: 0,
            sequence,
            plane: 0,
            width: 1,
            height: 1,
            channels: vec![vec![7]],
            acquired_at: Utc::now(),
            metadata: Arc::new(ScanMetadata {
                run_id: Uuid::new_v4(),
                area: 0,
                area_name: "a".into(),
                geometry: GeometrySnapshot::default(),
                samples_per_pixel: 1,
                line_samples: 1,
                frame_samples: 1,
                sample_rate_hz: 1.0,
                started_at: Utc::now(),
            }),
        })
    }

    #[test]
    fn test_memory_storage_keeps_order() {
        let storage = MemoryStorage::new();
        for i in 0..3 {
            storage.publish(image(i)).unwrap();
        }
        let seqs: Vec<_> = storage.images().iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_display_keeps_latest() {
        let display = LatestFrameDisplay::new();
        let rx = display.subscribe();
        display.publish(image(1)).unwrap();
        display.publish(image(2)).unwrap();
        assert_eq!(rx.borrow().as_ref().map(|i| i.sequence), Some(2));
        assert_eq!(display.shown(), 2);
    }
}
