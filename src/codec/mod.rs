//! Audio codec descriptions and decoder adapters.
//!
//! [`AudioCodec`] is the immutable per-stream codec record the transport
//! negotiates; everything the player needs per callback is derived from it.
//! The decoder adapters hide how each codec family consumes a packet: Opus
//! takes one frame at a time, Speex takes several subframes sliced by the
//! packet's frame sizes. The player drives them uniformly through
//! [`AudioFrameDecoder`].

mod decoder;
pub mod opus;
pub mod speex;

pub use decoder::AudioFrameDecoder;

/// Codec family of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    /// Speex with fixed-size frames; sizes derive from the codec record.
    SpeexCbr,
    /// Speex with variable-size frames; sizes ride along in each packet.
    SpeexVbr,
    Opus,
}

/// Speex band mode, which fixes the sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeexBandMode {
    Narrow,
    Wide,
    UltraWide,
}

impl SpeexBandMode {
    pub fn sample_rate(self) -> u32 {
        match self {
            Self::Narrow => 8_000,
            Self::Wide => 16_000,
            Self::UltraWide => 32_000,
        }
    }
}

/// Milliseconds of audio in one Speex frame.
const SPEEX_FRAME_MSEC: u32 = 20;

/// Immutable description of one audio stream's codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodec {
    pub family: CodecFamily,
    /// Channels the decoder emits, before stereo simulation.
    pub channels: u8,
    pub sample_rate: u32,
    /// Samples per channel produced by one decoded packet, i.e. one sink
    /// callback worth of audio.
    pub callback_samples: u32,
    pub callback_millis: u32,
    /// Encoded frames packed into one packet.
    pub frames_per_packet: u16,
    /// Bytes per encoded frame for fixed-rate families; zero otherwise.
    pub encoded_frame_size: u16,
    /// Duplicate the mono decode into both lanes of a stereo callback.
    pub simulate_stereo: bool,
}

impl AudioCodec {
    pub fn opus(sample_rate: u32, channels: u8, callback_millis: u32) -> Self {
        Self {
            family: CodecFamily::Opus,
            channels,
            sample_rate,
            callback_samples: sample_rate * callback_millis / 1_000,
            callback_millis,
            frames_per_packet: 1,
            encoded_frame_size: 0,
            simulate_stereo: false,
        }
    }

    pub fn speex_cbr(
        bandmode: SpeexBandMode,
        frames_per_packet: u16,
        encoded_frame_size: u16,
        simulate_stereo: bool,
    ) -> Self {
        let sample_rate = bandmode.sample_rate();
        let frame_samples = sample_rate * SPEEX_FRAME_MSEC / 1_000;
        Self {
            family: CodecFamily::SpeexCbr,
            channels: 1,
            sample_rate,
            callback_samples: frame_samples * frames_per_packet as u32,
            callback_millis: SPEEX_FRAME_MSEC * frames_per_packet as u32,
            frames_per_packet,
            encoded_frame_size,
            simulate_stereo,
        }
    }

    pub fn speex_vbr(
        bandmode: SpeexBandMode,
        frames_per_packet: u16,
        simulate_stereo: bool,
    ) -> Self {
        let mut codec = Self::speex_cbr(bandmode, frames_per_packet, 0, simulate_stereo);
        codec.family = CodecFamily::SpeexVbr;
        codec
    }

    /// Channels the sink callback carries, after stereo simulation.
    pub fn output_channels(&self) -> u8 {
        if self.simulate_stereo {
            2
        } else {
            self.channels
        }
    }

    /// Bytes in one callback of interleaved 16-bit PCM.
    pub fn callback_bytes(&self) -> usize {
        self.callback_samples as usize * self.output_channels() as usize * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_derived_quantities() {
        let codec = AudioCodec::opus(48_000, 1, 20);
        assert_eq!(codec.callback_samples, 960);
        assert_eq!(codec.callback_millis, 20);
        assert_eq!(codec.frames_per_packet, 1);
        assert_eq!(codec.output_channels(), 1);
        assert_eq!(codec.callback_bytes(), 960 * 2);
    }

    #[test]
    fn test_speex_derived_quantities() {
        let codec = AudioCodec::speex_cbr(SpeexBandMode::Wide, 2, 42, true);
        assert_eq!(codec.sample_rate, 16_000);
        assert_eq!(codec.callback_samples, 640);
        assert_eq!(codec.callback_millis, 40);
        assert_eq!(codec.channels, 1);
        assert_eq!(codec.output_channels(), 2);
        // stereo simulation doubles the callback footprint
        assert_eq!(codec.callback_bytes(), 640 * 2 * 2);
    }

    #[test]
    fn test_band_mode_rates() {
        assert_eq!(SpeexBandMode::Narrow.sample_rate(), 8_000);
        assert_eq!(SpeexBandMode::Wide.sample_rate(), 16_000);
        assert_eq!(SpeexBandMode::UltraWide.sample_rate(), 32_000);
    }
}
