//! Video decoder backend.
//!
//! The player drives decoding through [`VideoDecoderBackend`] so the codec
//! can be swapped per platform or stubbed in tests. [`Vp8Decoder`] is the
//! production backend: ffmpeg's native VP8 decoder with a BGRA scaler, gated
//! on the `ffmpeg` feature. Without the feature a stub rejects every frame so
//! the player's bookkeeping still runs.

use anyhow::Result;

/// Outcome of pushing one encoded frame into the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    /// The decoder cannot make sense of the bitstream; it needs a restart.
    UnsupportedBitstream,
    Failed,
}

pub trait VideoDecoderBackend: Send {
    fn open(&mut self, width: u16, height: u16) -> Result<()>;
    fn close(&mut self);
    /// Current frame dimensions, tracking mid-stream changes.
    fn dimensions(&self) -> (u16, u16);
    fn decode(&mut self, data: &[u8]) -> DecodeStatus;
    /// Copies the next decoded image as RGB32 into `out`. False when the
    /// decoder is drained.
    fn next_rgb32(&mut self, out: &mut [u8]) -> bool;
}

#[cfg(feature = "ffmpeg")]
pub use real::Vp8Decoder;

#[cfg(not(feature = "ffmpeg"))]
pub use stub::Vp8Decoder;

#[cfg(feature = "ffmpeg")]
mod real {
    use super::{DecodeStatus, VideoDecoderBackend};
    use anyhow::{Context, Result};
    use ffmpeg_next as ffmpeg;
    use tracing::warn;

    pub struct Vp8Decoder {
        decoder: Option<ffmpeg::decoder::Video>,
        scaler: Option<ffmpeg::software::scaling::Context>,
        width: u16,
        height: u16,
    }

    impl Vp8Decoder {
        pub fn new() -> Self {
            Self {
                decoder: None,
                scaler: None,
                width: 0,
                height: 0,
            }
        }
    }

    impl Default for Vp8Decoder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VideoDecoderBackend for Vp8Decoder {
        fn open(&mut self, width: u16, height: u16) -> Result<()> {
            ffmpeg::init().context("Failed to initialize ffmpeg")?;
            let codec = ffmpeg::decoder::find(ffmpeg::codec::Id::VP8)
                .context("ffmpeg build has no VP8 decoder")?;
            let ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
            let decoder = ctx
                .decoder()
                .video()
                .context("Failed to open VP8 decoder")?;

            self.decoder = Some(decoder);
            self.scaler = None;
            self.width = width;
            self.height = height;
            Ok(())
        }

        fn close(&mut self) {
            self.decoder = None;
            self.scaler = None;
        }

        fn dimensions(&self) -> (u16, u16) {
            (self.width, self.height)
        }

        fn decode(&mut self, data: &[u8]) -> DecodeStatus {
            let Some(decoder) = self.decoder.as_mut() else {
                return DecodeStatus::Failed;
            };
            let packet = ffmpeg::Packet::copy(data);
            match decoder.send_packet(&packet) {
                Ok(()) => DecodeStatus::Ok,
                Err(ffmpeg::Error::InvalidData) => DecodeStatus::UnsupportedBitstream,
                Err(e) => {
                    warn!("VP8 decode failed: {}", e);
                    DecodeStatus::Failed
                }
            }
        }

        fn next_rgb32(&mut self, out: &mut [u8]) -> bool {
            let Some(decoder) = self.decoder.as_mut() else {
                return false;
            };

            let mut frame = ffmpeg::frame::Video::empty();
            if decoder.receive_frame(&mut frame).is_err() {
                return false;
            }

            let (w, h) = (frame.width(), frame.height());
            if w == 0 || h == 0 {
                return false;
            }
            self.width = w as u16;
            self.height = h as u16;

            let needs_new_scaler = match &self.scaler {
                Some(s) => s.input().width != w || s.input().height != h,
                None => true,
            };
            if needs_new_scaler {
                self.scaler = ffmpeg::software::scaling::Context::get(
                    frame.format(),
                    w,
                    h,
                    ffmpeg::format::Pixel::BGRA,
                    w,
                    h,
                    ffmpeg::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| warn!("Failed to create scaler: {}", e))
                .ok();
            }
            let Some(scaler) = self.scaler.as_mut() else {
                return false;
            };

            let mut rgb = ffmpeg::frame::Video::empty();
            if let Err(e) = scaler.run(&frame, &mut rgb) {
                warn!("Pixel conversion failed: {}", e);
                return false;
            }

            let stride = rgb.stride(0);
            let row_bytes = w as usize * 4;
            let data = rgb.data(0);
            for y in 0..h as usize {
                let src = &data[y * stride..y * stride + row_bytes];
                let dst_start = y * row_bytes;
                if dst_start + row_bytes > out.len() {
                    break;
                }
                out[dst_start..dst_start + row_bytes].copy_from_slice(src);
            }
            true
        }
    }
}

#[cfg(not(feature = "ffmpeg"))]
mod stub {
    use super::{DecodeStatus, VideoDecoderBackend};
    use anyhow::Result;
    use tracing::warn;

    /// Stand-in used when the `ffmpeg` feature is off. Every frame fails to
    /// decode, so the player drops them and keeps its cursors moving.
    pub struct Vp8Decoder {
        width: u16,
        height: u16,
    }

    impl Vp8Decoder {
        pub fn new() -> Self {
            warn!("VP8 decoding needs the ffmpeg feature; frames will be dropped");
            Self {
                width: 0,
                height: 0,
            }
        }
    }

    impl Default for Vp8Decoder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VideoDecoderBackend for Vp8Decoder {
        fn open(&mut self, width: u16, height: u16) -> Result<()> {
            self.width = width;
            self.height = height;
            Ok(())
        }

        fn close(&mut self) {}

        fn dimensions(&self) -> (u16, u16) {
            (self.width, self.height)
        }

        fn decode(&mut self, _data: &[u8]) -> DecodeStatus {
            DecodeStatus::Failed
        }

        fn next_rgb32(&mut self, _out: &mut [u8]) -> bool {
            false
        }
    }
}
