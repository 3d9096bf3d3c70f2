//! Tagged union over the audio decoder adapters.
//!
//! Dispatching on the codec tag keeps the per-callback hot path free of
//! virtual calls and lets the player own its decoder by value.

use anyhow::Result;

use super::opus::OpusFrameDecoder;
use super::speex::SpeexFrameDecoder;
use super::{AudioCodec, CodecFamily};

pub enum AudioFrameDecoder {
    Opus(OpusFrameDecoder),
    Speex(SpeexFrameDecoder),
}

impl AudioFrameDecoder {
    pub fn new(codec: &AudioCodec) -> Result<Self> {
        match codec.family {
            CodecFamily::Opus => Ok(Self::Opus(OpusFrameDecoder::new(
                codec.sample_rate,
                codec.channels,
            )?)),
            CodecFamily::SpeexCbr | CodecFamily::SpeexVbr => {
                Ok(Self::Speex(SpeexFrameDecoder::new(
                    codec.sample_rate,
                    codec.channels,
                    codec.frames_per_packet,
                )?))
            }
        }
    }

    /// Decodes one buffered packet, or runs the family's concealment when
    /// `frame` is `None`. Always fills `n_samples` per channel.
    pub fn decode(&mut self, frame: Option<(&[u8], &[u16])>, output: &mut [i16], n_samples: usize) {
        match self {
            Self::Opus(d) => d.decode(frame, output, n_samples),
            Self::Speex(d) => d.decode(frame, output, n_samples),
        }
    }
}
