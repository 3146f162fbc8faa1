//! Data units that flow through the pipeline.
//!
//! [`DaqChunk`] moves by value from the Daq stage to the Pipeline stage.
//! [`AssembledImage`] is immutable once published and shared between Storage
//! and Display through [`SharedImage`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::GeometrySnapshot;
use crate::scanner::FrameLayout;

/// Raw input samples from one read of the hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct DaqChunk {
    /// Area that produced the chunk
    pub area: usize,
    /// Monotonic per-area chunk index, starting at 0
    pub sequence: u64,
    /// Absolute index of the first sample since the acquisition started
    pub first_sample: u64,
    /// One sample vector per input channel, all the same length
    pub channels: Vec<Vec<u16>>,
}

impl DaqChunk {
    /// Samples per channel.
    pub fn samples(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Number of input channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Acquisition parameters recorded with every image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMetadata {
    /// Identifies one orchestrator run
    pub run_id: Uuid,
    /// Area index
    pub area: usize,
    /// Area name from configuration
    pub area_name: String,
    /// Geometry the scanner vector was built from (coerced pixel time)
    pub geometry: GeometrySnapshot,
    /// Samples integrated per pixel
    pub samples_per_pixel: u32,
    /// Samples per line including lead and trail
    pub line_samples: usize,
    /// Samples per frame
    pub frame_samples: usize,
    /// Sample clock in Hz
    pub sample_rate_hz: f64,
    /// When the acquisition started
    pub started_at: DateTime<Utc>,
}

impl ScanMetadata {
    /// Metadata for a built layout.
    pub fn new(
        run_id: Uuid,
        area: usize,
        area_name: impl Into<String>,
        geometry: GeometrySnapshot,
        layout: &FrameLayout,
    ) -> Self {
        Self {
            run_id,
            area,
            area_name: area_name.into(),
            geometry,
            samples_per_pixel: layout.samples_per_pixel,
            line_samples: layout.line_samples,
            frame_samples: layout.frame_samples(),
            sample_rate_hz: layout.sample_rate_hz,
            started_at: Utc::now(),
        }
    }
}

/// One reconstructed multi-channel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledImage {
    /// Area index
    pub area: usize,
    /// Monotonic per-area frame index, starting at 0
    pub sequence: u64,
    /// Focal plane (0 unless plane hopping)
    pub plane: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row-major pixel plane per detector channel
    pub channels: Vec<Vec<u16>>,
    /// When the last sample of the frame was assembled
    pub acquired_at: DateTime<Utc>,
    /// Acquisition parameters
    pub metadata: Arc<ScanMetadata>,
}

/// Reference-counted, immutable image handed to every consumer.
pub type SharedImage = Arc<AssembledImage>;

impl AssembledImage {
    /// Pixels per channel.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Pixel value of `channel` at `(x, y)`.
    pub fn get(&self, channel: usize, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y as usize * self.width as usize + x as usize;
        self.channels.get(channel)?.get(idx).copied()
    }

    /// Mean pixel value of one channel.
    pub fn mean(&self, channel: usize) -> f64 {
        match self.channels.get(channel) {
            Some(plane) if !plane.is_empty() => {
                let sum: u64 = plane.iter().map(|&v| u64::from(v)).sum();
                sum as f64 / plane.len() as f64
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> AssembledImage {
        let metadata = ScanMetadata {
            run_id: Uuid::new_v4(),
            area: 0,
            area_name: "main".into(),
            geometry: GeometrySnapshot::default(),
            samples_per_pixel: 1,
            line_samples: 4,
            frame_samples: 8,
            sample_rate_hz: 1e6,
            started_at: Utc::now(),
        };
        AssembledImage {
            area: 0,
            sequence: 0,
            plane: 0,
            width: 2,
            height: 2,
            channels: vec![vec![1, 2, 3, 4], vec![10, 10, 10, 10]],
            acquired_at: Utc::now(),
            metadata: Arc::new(metadata),
        }
    }

    #[test]
    fn test_get_pixel() {
        let img = image();
        assert_eq!(img.get(0, 1, 1), Some(4));
        assert_eq!(img.get(1, 0, 1), Some(10));
        assert_eq!(img.get(0, 2, 0), None);
        assert_eq!(img.get(5, 0, 0), None);
    }

    #[test]
    fn test_mean() {
        let img = image();
        assert_eq!(img.mean(0), 2.5);
        assert_eq!(img.mean(1), 10.0);
        assert_eq!(img.mean(9), 0.0);
    }

    #[test]
    fn test_metadata_serializes() {
        let img = image();
        let json = serde_json::to_string(img.metadata.as_ref()).unwrap();
        assert!(json.contains("\"area_name\":\"main\""));
        let back: ScanMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, img.metadata.as_ref());
    }

    #[test]
    fn test_chunk_dimensions() {
        let chunk = DaqChunk {
            area: 1,
            sequence: 7,
            first_sample: 700,
            channels: vec![vec![0; 100], vec![0; 100]],
        };
        assert_eq!(chunk.samples(), 100);
        assert_eq!(chunk.channel_count(), 2);
    }
}
