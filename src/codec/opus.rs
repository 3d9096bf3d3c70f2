//! Opus decoder adapter.
//!
//! Opus carries one frame per packet here; the first entry of the packet's
//! frame sizes bounds the encoded data. Concealment feeds the decoder an
//! empty packet, which runs libopus' packet-loss concealment and keeps the
//! decoder's prediction state warm.

use anyhow::{Context, Result};
use opus::{Channels, Decoder};
use tracing::warn;

pub struct OpusFrameDecoder {
    decoder: Decoder,
    channels: usize,
}

impl OpusFrameDecoder {
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self> {
        let ch = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => anyhow::bail!("Opus supports 1 or 2 channels, got {}", n),
        };

        let decoder =
            Decoder::new(sample_rate, ch).context("Failed to create Opus decoder")?;

        Ok(Self {
            decoder,
            channels: channels as usize,
        })
    }

    /// Decodes one packet, or conceals a lost one when `frame` is `None`.
    ///
    /// `output` receives `n_samples` interleaved samples per channel; any
    /// shortfall from the decoder is zero-filled.
    pub fn decode(&mut self, frame: Option<(&[u8], &[u16])>, output: &mut [i16], n_samples: usize) {
        let want = n_samples * self.channels;
        let out = &mut output[..want];

        let result = match frame {
            Some((payload, sizes)) => {
                let frame_len = sizes
                    .first()
                    .map(|&s| (s as usize).min(payload.len()))
                    .unwrap_or(payload.len());
                self.decoder.decode(&payload[..frame_len], out, false)
            }
            None => self.decoder.decode(&[], out, false),
        };

        match result {
            Ok(decoded) => {
                let filled = decoded * self.channels;
                if filled < want {
                    out[filled..].fill(0);
                }
            }
            Err(e) => {
                warn!("Opus decode failed: {}", e);
                out.fill(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opus::{Application, Encoder};

    #[test]
    fn test_decode_roundtrip() {
        let mut encoder = Encoder::new(48_000, Channels::Mono, Application::Voip).unwrap();
        let mut decoder = OpusFrameDecoder::new(48_000, 1).unwrap();

        let pcm: Vec<i16> = (0..960)
            .map(|i| ((i as f32 * 0.05).sin() * 8_000.0) as i16)
            .collect();
        let mut packet = vec![0u8; 4_000];
        let len = encoder.encode(&pcm, &mut packet).unwrap();

        let sizes = [len as u16];
        let mut out = vec![0i16; 960];
        decoder.decode(Some((&packet[..len], &sizes)), &mut out, 960);
        assert!(out.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_concealment_fills_callback() {
        let mut decoder = OpusFrameDecoder::new(48_000, 2).unwrap();
        let mut out = vec![i16::MAX; 960 * 2];
        decoder.decode(None, &mut out, 960);
        // concealment from a cold decoder is near-silence, not the old junk
        assert!(out.iter().all(|&s| s.unsigned_abs() < 1_000));
    }

    #[test]
    fn test_garbage_packet_is_silenced() {
        let mut decoder = OpusFrameDecoder::new(48_000, 1).unwrap();
        let junk = [0xffu8; 7];
        let sizes = [7u16];
        let mut out = vec![i16::MAX; 960];
        decoder.decode(Some((&junk, &sizes)), &mut out, 960);
        // whether libopus rejects or decodes noise, the buffer is overwritten
        assert!(out.iter().any(|&s| s != i16::MAX));
    }
}
