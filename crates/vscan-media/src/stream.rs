//! Packed NV12 stream format written by preprocessing and read by the
//! decoder.
//!
//! Layout: a 16-byte header (magic, schema version, width, height) followed
//! by fixed-size frame records. Each record is a one-byte kind tag plus the
//! frame payload: key frames carry the canonical NV12 bytes, delta frames
//! carry the wrapping byte difference from the previous frame. Fixed-size
//! records make frame byte offsets computable; delta frames make the
//! keyframe index load-bearing for seeks.

use vscan_core::types::{KeyframeIndex, VideoMetadata};

use crate::MediaError;

pub const STREAM_MAGIC: [u8; 4] = *b"VSPK";
pub const STREAM_VERSION: u32 = 1;
pub const STREAM_HEADER_LEN: u64 = 16;

pub const KIND_KEY: u8 = b'K';
pub const KIND_DELTA: u8 = b'D';

/// Bytes of one frame record for the given frame payload size.
pub fn record_bytes(frame_bytes: usize) -> u64 {
    1 + frame_bytes as u64
}

/// Absolute byte offset of a frame's record within the stream.
pub fn frame_offset(frame_index: u32, frame_bytes: usize) -> u64 {
    STREAM_HEADER_LEN + frame_index as u64 * record_bytes(frame_bytes)
}

/// Frame index back out of a record offset.
pub fn frame_at_offset(offset: u64, frame_bytes: usize) -> u32 {
    ((offset - STREAM_HEADER_LEN) / record_bytes(frame_bytes)) as u32
}

pub fn encode_header(meta: &VideoMetadata) -> [u8; STREAM_HEADER_LEN as usize] {
    let mut out = [0u8; STREAM_HEADER_LEN as usize];
    out[0..4].copy_from_slice(&STREAM_MAGIC);
    out[4..8].copy_from_slice(&STREAM_VERSION.to_le_bytes());
    out[8..12].copy_from_slice(&meta.width.to_le_bytes());
    out[12..16].copy_from_slice(&meta.height.to_le_bytes());
    out
}

pub fn check_header(header: &[u8], meta: &VideoMetadata) -> Result<(), MediaError> {
    if header.len() < STREAM_HEADER_LEN as usize {
        return Err(MediaError::PackedStream("truncated header".to_string()));
    }
    if header[0..4] != STREAM_MAGIC {
        return Err(MediaError::PackedStream(format!(
            "bad magic {:?}",
            &header[0..4]
        )));
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&header[4..8]);
    let version = u32::from_le_bytes(word);
    if version != STREAM_VERSION {
        return Err(MediaError::PackedStream(format!(
            "unsupported stream version {version}"
        )));
    }
    word.copy_from_slice(&header[8..12]);
    let width = u32::from_le_bytes(word);
    word.copy_from_slice(&header[12..16]);
    let height = u32::from_le_bytes(word);
    if width != meta.width || height != meta.height {
        return Err(MediaError::PackedStream(format!(
            "stream is {width}x{height} but metadata says {}x{}",
            meta.width, meta.height
        )));
    }
    Ok(())
}

/// Incremental writer producing the stream bytes plus the keyframe index.
pub struct PackedStreamWriter {
    frame_bytes: usize,
    gop: u32,
    out: Vec<u8>,
    prev: Option<Vec<u8>>,
    frames: u32,
    index: KeyframeIndex,
}

impl PackedStreamWriter {
    pub fn new(meta: &VideoMetadata, gop: u32) -> Self {
        let mut out = Vec::new();
        out.extend_from_slice(&encode_header(meta));
        Self {
            frame_bytes: meta.frame_bytes(),
            gop: gop.max(1),
            out,
            prev: None,
            frames: 0,
            index: KeyframeIndex::default(),
        }
    }

    /// Append one canonical NV12 frame.
    pub fn push_frame(&mut self, frame: &[u8]) -> Result<(), MediaError> {
        if frame.len() != self.frame_bytes {
            return Err(MediaError::PackedStream(format!(
                "frame payload is {} bytes, expected {}",
                frame.len(),
                self.frame_bytes
            )));
        }

        let on_gop_boundary = self.frames % self.gop == 0;
        match self.prev.as_deref().filter(|_| !on_gop_boundary) {
            None => {
                self.index
                    .positions
                    .push(frame_offset(self.frames, self.frame_bytes));
                self.index.timestamps.push(self.frames as i64);
                self.out.push(KIND_KEY);
                self.out.extend_from_slice(frame);
            }
            Some(prev) => {
                self.out.push(KIND_DELTA);
                self.out
                    .extend(frame.iter().zip(prev).map(|(f, p)| f.wrapping_sub(*p)));
            }
        }

        self.prev = Some(frame.to_vec());
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn finish(self) -> (Vec<u8>, KeyframeIndex) {
        (self.out, self.index)
    }
}
