use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Zero-based GPU ordinal within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GpuId(pub usize);

impl std::fmt::Display for GpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pixel layout of decoded frames in the load buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Full-resolution luma plane followed by an interleaved half-height UV plane.
    Nv12,
}

impl PixelFormat {
    pub fn tag(self) -> u32 {
        match self {
            PixelFormat::Nv12 => 1,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

/// Per-video record produced by the preprocessing pass and shared read-only
/// with every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    pub pixel_format: PixelFormat,
}

impl VideoMetadata {
    /// Bytes of one frame at canonical pitch (`pitch == width`).
    pub fn frame_bytes(&self) -> usize {
        match self.pixel_format {
            // Luma w*h plus interleaved UV at w * h/2.
            PixelFormat::Nv12 => {
                let w = self.width as usize;
                let h = self.height as usize;
                w * h + w * (h / 2)
            }
        }
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.width == 0 || self.height == 0 {
            return Err(MetadataError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(MetadataError::OddDimensions {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("frame dimensions must be non-zero (got {width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("NV12 requires even dimensions (got {width}x{height})")]
    OddDimensions { width: u32, height: u32 },
    #[error("all videos must share frame dimensions: video {video_index} is {got_width}x{got_height}, expected {want_width}x{want_height}")]
    MixedDimensions {
        video_index: usize,
        got_width: u32,
        got_height: u32,
        want_width: u32,
        want_height: u32,
    },
}

/// Require every video to match the first one's frame geometry.
///
/// Buffer pools and evaluator scratch are sized once from `metadata[0]`, so a
/// mismatch is a configuration error rather than a latent decode fault.
pub fn check_uniform_dimensions(metadata: &[VideoMetadata]) -> Result<(), MetadataError> {
    let Some(first) = metadata.first() else {
        return Ok(());
    };
    for (i, m) in metadata.iter().enumerate().skip(1) {
        if m.width != first.width || m.height != first.height {
            return Err(MetadataError::MixedDimensions {
                video_index: i,
                got_width: m.width,
                got_height: m.height,
                want_width: first.width,
                want_height: first.height,
            });
        }
    }
    Ok(())
}

/// Per-video seek table: ascending byte offsets of decodable stream
/// positions with their timestamps. The decoder lands on the nearest entry
/// at or before a target and rolls forward from there.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyframeIndex {
    pub positions: Vec<u64>,
    pub timestamps: Vec<i64>,
}

impl KeyframeIndex {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Index of the last entry with `position <= byte_offset`.
    pub fn entry_at_or_before(&self, byte_offset: u64) -> Option<usize> {
        match self.positions.binary_search(&byte_offset) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    pub fn validate(&self) -> Result<(), KeyframeIndexError> {
        if self.positions.len() != self.timestamps.len() {
            return Err(KeyframeIndexError::LengthMismatch {
                positions: self.positions.len(),
                timestamps: self.timestamps.len(),
            });
        }
        if self.positions.windows(2).any(|w| w[0] >= w[1]) {
            return Err(KeyframeIndexError::Unsorted);
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyframeIndexError {
    #[error("positions ({positions}) and timestamps ({timestamps}) must have equal length")]
    LengthMismatch { positions: usize, timestamps: usize },
    #[error("byte positions must be strictly ascending")]
    Unsorted,
}

/// One contiguous frame range of one video; the atomic unit of cluster
/// balancing. Frame range is half-open `[start_frame, end_frame)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub video_index: usize,
    pub start_frame: u32,
    pub end_frame: u32,
}

impl WorkItem {
    pub fn len(&self) -> u32 {
        self.end_frame.saturating_sub(self.start_frame)
    }

    pub fn is_empty(&self) -> bool {
        self.start_frame >= self.end_frame
    }

    pub fn contains(&self, frame: u32) -> bool {
        self.start_frame <= frame && frame < self.end_frame
    }
}

/// Partition every video into ranges of exactly `frames_per_work_item`
/// frames, the last range of each video possibly shorter.
///
/// Output order is videos in input order, frames ascending, so every node
/// computes an identical list from the replicated metadata.
pub fn plan_work_items(metadata: &[VideoMetadata], frames_per_work_item: u32) -> Vec<WorkItem> {
    let mut items = Vec::new();
    if frames_per_work_item == 0 {
        return items;
    }
    for (video_index, meta) in metadata.iter().enumerate() {
        let mut allocated = 0u32;
        while allocated < meta.frames {
            let take = frames_per_work_item.min(meta.frames - allocated);
            items.push(WorkItem {
                video_index,
                start_frame: allocated,
                end_frame: allocated + take,
            });
            allocated += take;
        }
    }
    items
}

/// Operator-configured shape of one node's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub gpus_per_node: usize,
    /// Network input batch; one forward pass consumes this many frames.
    pub batch_size: u32,
    pub batches_per_work_item: u32,
    /// Target queue depth per GPU; also the buffer-pool depth per GPU.
    pub tasks_in_queue_per_gpu: usize,
    pub load_workers_per_node: usize,
    /// Stream lanes per evaluator for overlapping per-frame preprocessing.
    pub num_streams: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gpus_per_node: 1,
            batch_size: 64,
            batches_per_work_item: 4,
            tasks_in_queue_per_gpu: 4,
            load_workers_per_node: 2,
            num_streams: 32,
        }
    }
}

impl PipelineConfig {
    pub fn frames_per_work_item(&self) -> u32 {
        self.batch_size * self.batches_per_work_item
    }

    /// Buffers allocated per GPU; the free queue holding them is the node's
    /// backpressure mechanism.
    pub fn load_buffers_per_gpu(&self) -> usize {
        self.tasks_in_queue_per_gpu
    }

    /// Backlog threshold below which a node asks the allocator for more work.
    pub fn queue_threshold(&self) -> usize {
        self.gpus_per_node * self.tasks_in_queue_per_gpu
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gpus_per_node == 0 {
            return Err(ConfigError::Zero("gpus_per_node"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.batches_per_work_item == 0 {
            return Err(ConfigError::Zero("batches_per_work_item"));
        }
        if self.tasks_in_queue_per_gpu == 0 {
            return Err(ConfigError::Zero("tasks_in_queue_per_gpu"));
        }
        if self.load_workers_per_node == 0 {
            return Err(ConfigError::Zero("load_workers_per_node"));
        }
        if self.num_streams == 0 {
            return Err(ConfigError::Zero("num_streams"));
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_frame_bytes() {
        let meta = VideoMetadata {
            width: 640,
            height: 480,
            frames: 1,
            pixel_format: PixelFormat::Nv12,
        };
        assert_eq!(meta.frame_bytes(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn odd_dimensions_rejected() {
        let meta = VideoMetadata {
            width: 641,
            height: 480,
            frames: 1,
            pixel_format: PixelFormat::Nv12,
        };
        assert!(matches!(
            meta.validate(),
            Err(MetadataError::OddDimensions { .. })
        ));
    }

    #[test]
    fn keyframe_lookup_lands_at_or_before() {
        let index = KeyframeIndex {
            positions: vec![16, 100, 200],
            timestamps: vec![0, 4, 8],
        };
        index.validate().unwrap();
        assert_eq!(index.entry_at_or_before(15), None);
        assert_eq!(index.entry_at_or_before(16), Some(0));
        assert_eq!(index.entry_at_or_before(150), Some(1));
        assert_eq!(index.entry_at_or_before(200), Some(2));
        assert_eq!(index.entry_at_or_before(u64::MAX), Some(2));
    }

    #[test]
    fn config_threshold_and_item_size() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.frames_per_work_item(), 256);
        assert_eq!(cfg.queue_threshold(), 4);
        assert_eq!(cfg.load_buffers_per_gpu(), 4);
        cfg.validate().unwrap();
    }
}
