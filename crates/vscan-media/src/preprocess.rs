//! One-shot preprocessing pass.
//!
//! Turns an input video (Y4M ingest) into the three artifacts the pipeline
//! reads: the packed NV12 stream, the binary metadata record, and the
//! keyframe index. Runs on the master only, and a run that had to
//! preprocess anything stops before the pipeline starts.

use std::path::Path;

use tracing::info;

use vscan_core::types::{PixelFormat, VideoMetadata};
use vscan_store::codec::{encode_keyframe_index, encode_metadata};
use vscan_store::paths::{iframe_path, metadata_path, processed_video_path};
use vscan_store::{write_atomic, Storage};

use crate::stream::PackedStreamWriter;
use crate::y4m::Y4mReader;
use crate::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessConfig {
    /// Keyframe cadence of the packed stream.
    pub gop: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self { gop: 16 }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<(), MediaError> {
        if self.gop == 0 {
            return Err(MediaError::PackedStream("gop must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessSummary {
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    pub keyframes: usize,
}

/// True when all three artifacts for `video_path` already exist.
pub fn artifacts_present(storage: &Storage, video_path: &Path) -> Result<bool, MediaError> {
    for path in [
        processed_video_path(video_path),
        metadata_path(video_path),
        iframe_path(video_path),
    ] {
        if !storage.file_info(&path)?.exists {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn preprocess_video(
    video_path: &Path,
    cfg: &PreprocessConfig,
) -> Result<PreprocessSummary, MediaError> {
    cfg.validate()?;

    let input = std::fs::File::open(video_path)?;
    let mut reader = Y4mReader::new(input)?;
    let header = reader.header();

    let mut meta = VideoMetadata {
        width: header.width,
        height: header.height,
        frames: 0,
        pixel_format: PixelFormat::Nv12,
    };
    meta.validate()
        .map_err(|e| MediaError::Y4m(e.to_string()))?;

    let mut writer = PackedStreamWriter::new(&meta, cfg.gop);
    while let Some(frame) = reader.next_frame_nv12()? {
        writer.push_frame(&frame)?;
    }
    meta.frames = writer.frames();

    let (stream_bytes, index) = writer.finish();
    write_atomic(&processed_video_path(video_path), &stream_bytes)?;
    write_atomic(&metadata_path(video_path), &encode_metadata(&meta))?;
    write_atomic(&iframe_path(video_path), &encode_keyframe_index(&index))?;

    let summary = PreprocessSummary {
        width: meta.width,
        height: meta.height,
        frames: meta.frames,
        keyframes: index.len(),
    };
    info!(
        event = "video_preprocessed",
        path = %video_path.display(),
        width = summary.width,
        height = summary.height,
        frames = summary.frames,
        keyframes = summary.keyframes as u64,
        "preprocessed video"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoder;
    use crate::y4m::write_y4m;
    use vscan_store::codec::{decode_keyframe_index, decode_metadata};

    fn i420_frame(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let y = (width * height) as usize;
        let c = y / 4;
        (0..y + 2 * c).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn preprocess_then_decode_roundtrips() {
        let dir = std::env::temp_dir().join(format!("vscan-preprocess-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let video = dir.join("clip.y4m");

        let frames: Vec<Vec<u8>> = (0..9u8).map(|i| i420_frame(4, 4, i * 7)).collect();
        std::fs::write(&video, write_y4m(4, 4, &frames)).unwrap();

        let summary = preprocess_video(&video, &PreprocessConfig { gop: 4 }).unwrap();
        assert_eq!(summary.frames, 9);
        assert_eq!(summary.keyframes, 3);

        let storage = Storage::disk();
        assert!(artifacts_present(&storage, &video).unwrap());

        let meta = decode_metadata(
            &storage
                .open_random_read(&metadata_path(&video))
                .unwrap()
                .read_to_end()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(meta.frames, 9);

        let index = decode_keyframe_index(
            &storage
                .open_random_read(&iframe_path(&video))
                .unwrap()
                .read_to_end()
                .unwrap(),
        )
        .unwrap();

        let file = storage
            .open_random_read(&processed_video_path(&video))
            .unwrap();
        let mut decoder = Decoder::open(None, file, &meta, index).unwrap();
        decoder.seek(5).unwrap();
        let frame = decoder.decode().unwrap();
        // Frame 5 luma should match the ingested I420 luma.
        assert_eq!(frame.y, &frames[5][..16]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn artifacts_absent_before_preprocess() {
        let dir = std::env::temp_dir().join(format!("vscan-preprocess-gate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let video = dir.join("fresh.y4m");
        std::fs::write(&video, write_y4m(4, 4, &[i420_frame(4, 4, 1)])).unwrap();

        assert!(!artifacts_present(&Storage::disk(), &video).unwrap());
        let _ = std::fs::remove_dir_all(dir);
    }
}
