#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod decode;
pub mod frame;
pub mod preprocess;
pub mod stream;
pub mod y4m;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("y4m parse error: {0}")]
    Y4m(String),
    #[error("packed stream error: {0}")]
    PackedStream(String),
    #[error("seek target {target} is out of range (video has {frames} frames)")]
    SeekOutOfRange { target: u32, frames: u32 },
    #[error("decode past end of stream (frame {0})")]
    PastEnd(u32),
    #[error(transparent)]
    Codec(#[from] vscan_store::codec::CodecError),
    #[error(transparent)]
    Storage(#[from] vscan_store::StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
