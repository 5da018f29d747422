//! Decoder seam for the load pipeline.
//!
//! Decoders are variant types selected once per open. The packed software
//! decoder ships with the crate; hardware decoders plug in as further
//! variants and receive the GPU that owns the destination buffer.

use std::time::{Duration, Instant};

use vscan_core::types::{GpuId, KeyframeIndex, VideoMetadata};
use vscan_store::RandomReadFile;

use crate::frame::FrameView;
use crate::stream::{
    check_header, frame_at_offset, frame_offset, record_bytes, KIND_DELTA, KIND_KEY,
    STREAM_HEADER_LEN,
};
use crate::MediaError;

pub enum Decoder {
    PackedNv12(PackedNv12Decoder),
}

impl Decoder {
    /// Open a decoder for one processed video.
    ///
    /// `gpu` names the device whose buffer the frames will land in; the
    /// software decoder has no device state and ignores it.
    pub fn open(
        _gpu: Option<GpuId>,
        file: RandomReadFile,
        meta: &VideoMetadata,
        index: KeyframeIndex,
    ) -> Result<Self, MediaError> {
        Ok(Decoder::PackedNv12(PackedNv12Decoder::open(
            file, meta, index,
        )?))
    }

    /// Position the decoder so the next [`decode`](Self::decode) returns
    /// `frame`. Lands on the nearest keyframe at or before the target and
    /// rolls forward.
    pub fn seek(&mut self, frame: u32) -> Result<(), MediaError> {
        match self {
            Decoder::PackedNv12(d) => d.seek(frame),
        }
    }

    pub fn decode(&mut self) -> Result<FrameView<'_>, MediaError> {
        match self {
            Decoder::PackedNv12(d) => d.decode(),
        }
    }

    /// Cumulative time spent reading stream bytes.
    pub fn io_time(&self) -> Duration {
        match self {
            Decoder::PackedNv12(d) => d.io_time,
        }
    }

    /// Cumulative time spent reconstructing frames.
    pub fn decode_time(&self) -> Duration {
        match self {
            Decoder::PackedNv12(d) => d.decode_time,
        }
    }
}

/// Software decoder for the packed NV12 stream.
pub struct PackedNv12Decoder {
    file: RandomReadFile,
    index: KeyframeIndex,
    meta: VideoMetadata,
    frame_bytes: usize,
    /// Next frame [`decode`](Self::decode) will produce.
    next_frame: u32,
    /// Accumulator holding the last reconstructed frame; delta records apply
    /// on top of it.
    current: Vec<u8>,
    /// True once `current` holds a reconstructed frame.
    have_base: bool,
    record: Vec<u8>,
    io_time: Duration,
    decode_time: Duration,
}

impl PackedNv12Decoder {
    pub fn open(
        mut file: RandomReadFile,
        meta: &VideoMetadata,
        index: KeyframeIndex,
    ) -> Result<Self, MediaError> {
        let mut header = [0u8; STREAM_HEADER_LEN as usize];
        file.read_exact_at(0, &mut header)?;
        check_header(&header, meta)?;

        let frame_bytes = meta.frame_bytes();
        let expected = STREAM_HEADER_LEN + meta.frames as u64 * record_bytes(frame_bytes);
        if file.len() < expected {
            return Err(MediaError::PackedStream(format!(
                "stream holds {} bytes but metadata implies {expected}",
                file.len()
            )));
        }

        Ok(Self {
            file,
            index,
            meta: *meta,
            frame_bytes,
            next_frame: 0,
            current: vec![0u8; frame_bytes],
            have_base: false,
            record: vec![0u8; 1 + frame_bytes],
            io_time: Duration::ZERO,
            decode_time: Duration::ZERO,
        })
    }

    pub fn seek(&mut self, frame: u32) -> Result<(), MediaError> {
        if frame >= self.meta.frames {
            return Err(MediaError::SeekOutOfRange {
                target: frame,
                frames: self.meta.frames,
            });
        }

        let target_offset = frame_offset(frame, self.frame_bytes);
        let entry = self
            .index
            .entry_at_or_before(target_offset)
            .ok_or_else(|| {
                MediaError::PackedStream(format!("no keyframe at or before frame {frame}"))
            })?;
        let key_frame = frame_at_offset(self.index.positions[entry], self.frame_bytes);

        // Re-reading from the keyframe is only needed when jumping backwards
        // or across an undecoded gap.
        if !(self.have_base && self.next_frame <= frame && self.next_frame > key_frame) {
            self.next_frame = key_frame;
            self.have_base = false;
        }
        while self.next_frame < frame {
            self.advance()?;
        }
        Ok(())
    }

    pub fn decode(&mut self) -> Result<FrameView<'_>, MediaError> {
        self.advance()?;
        let w = self.meta.width as usize;
        let h = self.meta.height as usize;
        let (y, uv) = self.current.split_at(w * h);
        Ok(FrameView {
            width: self.meta.width,
            height: self.meta.height,
            y,
            y_stride: w,
            uv,
            uv_stride: w,
        })
    }

    fn advance(&mut self) -> Result<(), MediaError> {
        if self.next_frame >= self.meta.frames {
            return Err(MediaError::PastEnd(self.next_frame));
        }

        let offset = frame_offset(self.next_frame, self.frame_bytes);
        let io_start = Instant::now();
        self.file.read_exact_at(offset, &mut self.record)?;
        self.io_time += io_start.elapsed();

        let decode_start = Instant::now();
        let (kind, payload) = (self.record[0], &self.record[1..]);
        match kind {
            KIND_KEY => {
                self.current.copy_from_slice(payload);
                self.have_base = true;
            }
            KIND_DELTA => {
                if !self.have_base {
                    return Err(MediaError::PackedStream(format!(
                        "delta record at frame {} with no base frame",
                        self.next_frame
                    )));
                }
                for (cur, delta) in self.current.iter_mut().zip(payload) {
                    *cur = cur.wrapping_add(*delta);
                }
            }
            other => {
                return Err(MediaError::PackedStream(format!(
                    "unknown record kind {other:#x} at frame {}",
                    self.next_frame
                )));
            }
        }
        self.decode_time += decode_start.elapsed();
        self.next_frame += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PackedStreamWriter;
    use vscan_core::types::PixelFormat;
    use vscan_store::{write_atomic, Storage};

    fn test_video(frames: u32, gop: u32) -> (VideoMetadata, Vec<Vec<u8>>, Vec<u8>, KeyframeIndex) {
        let meta = VideoMetadata {
            width: 4,
            height: 4,
            frames,
            pixel_format: PixelFormat::Nv12,
        };
        let fb = meta.frame_bytes();
        let originals: Vec<Vec<u8>> = (0..frames)
            .map(|i| (0..fb).map(|b| (i as usize * 31 + b) as u8).collect())
            .collect();

        let mut writer = PackedStreamWriter::new(&meta, gop);
        for frame in &originals {
            writer.push_frame(frame).unwrap();
        }
        let (bytes, index) = writer.finish();
        (meta, originals, bytes, index)
    }

    fn open_decoder(name: &str, meta: &VideoMetadata, bytes: &[u8], index: KeyframeIndex) -> Decoder {
        let dir = std::env::temp_dir().join(format!("vscan-decode-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("clip_processed.nv12");
        write_atomic(&path, bytes).unwrap();
        let file = Storage::disk().open_random_read(&path).unwrap();
        Decoder::open(None, file, meta, index).unwrap()
    }

    #[test]
    fn sequential_decode_reconstructs_every_frame() {
        let (meta, originals, bytes, index) = test_video(10, 4);
        let mut decoder = open_decoder("seq", &meta, &bytes, index);
        for original in &originals {
            let frame = decoder.decode().unwrap();
            assert_eq!(frame.y_stride, 4);
            let mut got = frame.y.to_vec();
            got.extend_from_slice(frame.uv);
            assert_eq!(&got, original);
        }
        assert!(decoder.decode().is_err());
        assert!(decoder.io_time() > Duration::ZERO);
    }

    #[test]
    fn seek_lands_mid_gop() {
        let (meta, originals, bytes, index) = test_video(12, 4);
        let mut decoder = open_decoder("midgop", &meta, &bytes, index);
        // Frame 6 sits between keyframes 4 and 8.
        decoder.seek(6).unwrap();
        let frame = decoder.decode().unwrap();
        assert_eq!(frame.y, &originals[6][..16]);
    }

    #[test]
    fn seek_backwards_restarts_from_keyframe() {
        let (meta, originals, bytes, index) = test_video(12, 4);
        let mut decoder = open_decoder("back", &meta, &bytes, index);
        decoder.seek(9).unwrap();
        let _ = decoder.decode().unwrap();
        decoder.seek(1).unwrap();
        let frame = decoder.decode().unwrap();
        assert_eq!(frame.y, &originals[1][..16]);
    }

    #[test]
    fn seek_past_end_is_rejected() {
        let (meta, _, bytes, index) = test_video(5, 4);
        let mut decoder = open_decoder("past", &meta, &bytes, index);
        assert!(matches!(
            decoder.seek(5),
            Err(MediaError::SeekOutOfRange { target: 5, frames: 5 })
        ));
    }
}
