//! Collaborator contracts for post-decode audio.
//!
//! The player forwards every decoded callback to an [`AudioMuxer`] (mixing
//! and recording) and optionally to an [`AudioContainer`] observer. Both live
//! outside this crate; they are injected rather than reached through globals
//! so a session can wire its own recording pipeline.

use crate::codec::AudioCodec;
use crate::packet::StreamType;

/// Receives each callback's PCM for mixing and recording.
///
/// `pcm` is `None` when the callback produced no audio (silence or a stream
/// that just ended). `sample_no` is the player's running total of samples
/// played when this block started. `stream_ended` marks the final block of a
/// talkspurt.
pub trait AudioMuxer: Send + Sync {
    fn queue_user_audio(
        &self,
        user_id: u32,
        pcm: Option<&[i16]>,
        sample_no: u64,
        stream_ended: bool,
        codec: &AudioCodec,
    );
}

/// Optional observer that tees decoded PCM out of the playback path.
///
/// Returns true when the block was accepted; the player only counts accepted
/// blocks.
pub trait AudioContainer: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn add_audio(
        &self,
        sound_group: u32,
        user_id: u32,
        stream_type: StreamType,
        stream_id: u8,
        sample_rate: u32,
        channels: u8,
        pcm: &[i16],
        n_samples: usize,
        sample_no: u64,
    ) -> bool;
}

/// Muxer that discards everything. Handy for players that only play.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMuxer;

impl AudioMuxer for NullMuxer {
    fn queue_user_audio(
        &self,
        _user_id: u32,
        _pcm: Option<&[i16]>,
        _sample_no: u64,
        _stream_ended: bool,
        _codec: &AudioCodec,
    ) {
    }
}
