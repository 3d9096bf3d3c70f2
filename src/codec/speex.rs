//! Speex decoder adapter.
//!
//! A Speex packet carries `frames_per_packet` encoded subframes back to back;
//! the packet's frame sizes say where each one ends. Decoding walks the
//! subframes and appends their PCM. Concealment hands the decoder an empty
//! subframe per missing frame and lets it extrapolate, keeping its prediction
//! state warm.
//!
//! The real decode path uses ffmpeg's native Speex decoder and is gated on
//! the `ffmpeg` feature. Without it the backend produces silence so playback
//! timing stays intact.

use anyhow::Result;

pub struct SpeexFrameDecoder {
    backend: backend::SpeexBackend,
    channels: usize,
    frames_per_packet: usize,
}

impl SpeexFrameDecoder {
    pub fn new(sample_rate: u32, channels: u8, frames_per_packet: u16) -> Result<Self> {
        Ok(Self {
            backend: backend::SpeexBackend::new(sample_rate, channels)?,
            channels: channels as usize,
            frames_per_packet: frames_per_packet.max(1) as usize,
        })
    }

    /// Decodes one packet, or conceals a lost one when `frame` is `None`.
    pub fn decode(&mut self, frame: Option<(&[u8], &[u16])>, output: &mut [i16], n_samples: usize) {
        let want = n_samples * self.channels;
        let out = &mut output[..want];
        let subframe_len = (want / self.frames_per_packet).max(1);

        match frame {
            Some((payload, sizes)) => {
                let mut offset = 0;
                let mut produced = 0;
                for &size in sizes {
                    if produced >= want {
                        break;
                    }
                    let end = (offset + size as usize).min(payload.len());
                    let dst_end = (produced + subframe_len).min(want);
                    let dst = &mut out[produced..dst_end];
                    let n = if size == 0 || offset >= payload.len() {
                        self.backend.conceal(dst)
                    } else {
                        self.backend.decode_subframe(&payload[offset..end], dst)
                    };
                    dst[n..].fill(0);
                    offset = end;
                    produced = dst_end;
                }
                out[produced..].fill(0);
            }
            None => {
                let mut produced = 0;
                for _ in 0..self.frames_per_packet {
                    if produced >= want {
                        break;
                    }
                    let dst_end = (produced + subframe_len).min(want);
                    let dst = &mut out[produced..dst_end];
                    let n = self.backend.conceal(dst);
                    dst[n..].fill(0);
                    produced = dst_end;
                }
                out[produced..].fill(0);
            }
        }
    }
}

#[cfg(feature = "ffmpeg")]
mod backend {
    use anyhow::{Context, Result};
    use ffmpeg_next as ffmpeg;
    use tracing::{trace, warn};

    pub struct SpeexBackend {
        decoder: ffmpeg::decoder::Audio,
        channels: usize,
    }

    impl SpeexBackend {
        pub fn new(sample_rate: u32, channels: u8) -> Result<Self> {
            ffmpeg::init().context("Failed to initialize ffmpeg")?;
            let codec = ffmpeg::decoder::find(ffmpeg::codec::Id::SPEEX)
                .context("ffmpeg build has no Speex decoder")?;
            let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
            // raw Speex frames carry no header; seed the stream parameters
            unsafe {
                let raw = ctx.as_mut_ptr();
                (*raw).sample_rate = sample_rate as i32;
                ffmpeg::ffi::av_channel_layout_default(&mut (*raw).ch_layout, i32::from(channels));
            }
            let decoder = ctx
                .decoder()
                .audio()
                .context("Failed to open Speex decoder")?;

            Ok(Self {
                decoder,
                channels: channels as usize,
            })
        }

        /// Decodes one encoded subframe into `dst`, returning the number of
        /// samples written.
        pub fn decode_subframe(&mut self, data: &[u8], dst: &mut [i16]) -> usize {
            let packet = ffmpeg::Packet::copy(data);
            if let Err(e) = self.decoder.send_packet(&packet) {
                warn!("Speex decode failed: {}", e);
                return 0;
            }
            self.receive_into(dst)
        }

        /// Decoder-internal loss concealment: a zero-length subframe makes
        /// the decoder extrapolate from its prediction state. Decoders that
        /// refuse the empty packet produce nothing and the caller pads with
        /// silence.
        pub fn conceal(&mut self, dst: &mut [i16]) -> usize {
            let packet = ffmpeg::Packet::copy(&[]);
            if let Err(e) = self.decoder.send_packet(&packet) {
                trace!("Speex concealment not taken by decoder: {}", e);
                return 0;
            }
            self.receive_into(dst)
        }

        fn receive_into(&mut self, dst: &mut [i16]) -> usize {
            let mut frame = ffmpeg::frame::Audio::empty();
            let mut filled = 0;
            while self.decoder.receive_frame(&mut frame).is_ok() {
                if frame.format()
                    != ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed)
                {
                    warn!("Unexpected Speex sample format {:?}", frame.format());
                    continue;
                }
                let n = (frame.samples() * self.channels).min(dst.len() - filled);
                let bytes = frame.data(0);
                for (i, pair) in bytes.chunks_exact(2).take(n).enumerate() {
                    dst[filled + i] = i16::from_ne_bytes([pair[0], pair[1]]);
                }
                filled += n;
            }
            filled
        }
    }
}

#[cfg(not(feature = "ffmpeg"))]
mod backend {
    use anyhow::Result;
    use tracing::warn;

    /// Stand-in used when the `ffmpeg` feature is off: subframes and
    /// concealment both come out as silence so the pacing paths still behave.
    pub struct SpeexBackend;

    impl SpeexBackend {
        pub fn new(_sample_rate: u32, _channels: u8) -> Result<Self> {
            warn!("Speex decoding needs the ffmpeg feature; emitting silence");
            Ok(Self)
        }

        pub fn decode_subframe(&mut self, _data: &[u8], dst: &mut [i16]) -> usize {
            dst.fill(0);
            dst.len()
        }

        pub fn conceal(&mut self, dst: &mut [i16]) -> usize {
            dst.fill(0);
            dst.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concealment_fills_whole_callback() {
        let mut decoder = SpeexFrameDecoder::new(16_000, 1, 2).unwrap();
        let mut out = vec![i16::MAX; 640];
        decoder.decode(None, &mut out, 640);
        // every sample is written, from the decoder or as silence padding
        assert!(!out.contains(&i16::MAX));
    }

    #[test]
    fn test_decode_fills_whole_callback() {
        let mut decoder = SpeexFrameDecoder::new(8_000, 1, 2).unwrap();
        let payload = vec![0u8; 40];
        let sizes = [20u16, 20];
        let mut out = vec![i16::MAX; 320];
        decoder.decode(Some((&payload, &sizes)), &mut out, 320);
        // every sample is overwritten, whatever the backend made of the bits
        assert!(!out.contains(&i16::MAX));
    }

    #[test]
    fn test_short_payload_conceals_missing_subframe() {
        let mut decoder = SpeexFrameDecoder::new(8_000, 1, 2).unwrap();
        let payload = vec![0u8; 20];
        let sizes = [20u16, 20];
        let mut out = vec![i16::MAX; 320];
        decoder.decode(Some((&payload, &sizes)), &mut out, 320);
        assert!(!out.contains(&i16::MAX));
    }
}
