//! Binary artifact codecs.
//!
//! Both records carry a four-byte magic and a schema version so a stale or
//! foreign file fails loudly instead of decoding into garbage. All integers
//! are little-endian.

use thiserror::Error;

use vscan_core::types::{KeyframeIndex, PixelFormat, VideoMetadata};

pub const METADATA_MAGIC: [u8; 4] = *b"VSMD";
pub const IFRAME_MAGIC: [u8; 4] = *b"VSIF";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic: expected {expected:?}, got {got:?}")]
    BadMagic { expected: [u8; 4], got: [u8; 4] },
    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u32),
    #[error("record truncated at byte {0}")]
    Truncated(usize),
    #[error("unknown pixel format tag {0}")]
    UnknownPixelFormat(u32),
    #[error("invalid keyframe index: {0}")]
    InvalidIndex(String),
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(CodecError::Truncated(self.pos))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn magic(&mut self, expected: [u8; 4]) -> Result<(), CodecError> {
        let raw = self.take(4)?;
        let mut got = [0u8; 4];
        got.copy_from_slice(raw);
        if got != expected {
            return Err(CodecError::BadMagic { expected, got });
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let raw = self.take(4)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(raw);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let raw = self.take(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(raw);
        Ok(u64::from_le_bytes(b))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        let raw = self.take(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(raw);
        Ok(i64::from_le_bytes(b))
    }

    fn version(&mut self) -> Result<(), CodecError> {
        let version = self.u32()?;
        if version != SCHEMA_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Ok(())
    }
}

pub fn encode_metadata(meta: &VideoMetadata) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 * 5);
    out.extend_from_slice(&METADATA_MAGIC);
    out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    out.extend_from_slice(&meta.width.to_le_bytes());
    out.extend_from_slice(&meta.height.to_le_bytes());
    out.extend_from_slice(&meta.frames.to_le_bytes());
    out.extend_from_slice(&meta.pixel_format.tag().to_le_bytes());
    out
}

pub fn decode_metadata(bytes: &[u8]) -> Result<VideoMetadata, CodecError> {
    let mut cur = Cursor::new(bytes);
    cur.magic(METADATA_MAGIC)?;
    cur.version()?;
    let width = cur.u32()?;
    let height = cur.u32()?;
    let frames = cur.u32()?;
    let tag = cur.u32()?;
    let pixel_format = PixelFormat::from_tag(tag).ok_or(CodecError::UnknownPixelFormat(tag))?;
    Ok(VideoMetadata {
        width,
        height,
        frames,
        pixel_format,
    })
}

pub fn encode_keyframe_index(index: &KeyframeIndex) -> Vec<u8> {
    let n = index.positions.len();
    let mut out = Vec::with_capacity(4 + 4 + 4 + 16 * n);
    out.extend_from_slice(&IFRAME_MAGIC);
    out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    out.extend_from_slice(&(n as u32).to_le_bytes());
    for pos in &index.positions {
        out.extend_from_slice(&pos.to_le_bytes());
    }
    for ts in &index.timestamps {
        out.extend_from_slice(&ts.to_le_bytes());
    }
    out
}

pub fn decode_keyframe_index(bytes: &[u8]) -> Result<KeyframeIndex, CodecError> {
    let mut cur = Cursor::new(bytes);
    cur.magic(IFRAME_MAGIC)?;
    cur.version()?;
    let count = cur.u32()? as usize;

    let mut positions = Vec::with_capacity(count);
    for _ in 0..count {
        positions.push(cur.u64()?);
    }
    let mut timestamps = Vec::with_capacity(count);
    for _ in 0..count {
        timestamps.push(cur.i64()?);
    }

    let index = KeyframeIndex {
        positions,
        timestamps,
    };
    index
        .validate()
        .map_err(|e| CodecError::InvalidIndex(e.to_string()))?;
    Ok(index)
}
