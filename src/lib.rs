//! Receiver-side media stream player core.
//!
//! Turns the unordered, fragmented, lossy packet sequence a transport
//! delivers into paced, decoded media: audio callbacks for a sound sink and
//! RGB32 frames for a renderer.
//!
//! # Architecture
//!
//! ```text
//! transport thread                          sink / renderer thread
//! ────────────────                          ──────────────────────
//! AudioPacket ──► PlayerRegistry
//!                     └─► AudioPlayer ◄──── pull(out, n_samples)
//!                           ├─ fragment reassembly
//!                           ├─ jitter buffer (budget-bounded)
//!                           ├─ decode / loss concealment
//!                           └─ muxer + container taps
//!
//! VideoPacket ──► VideoPlayer ◄──────────── pull_next(horizon)
//!                   ├─ fragment reassembly
//!                   ├─ frame store (presentation order)
//!                   └─ VP8 decode, restart on bad bitstream
//! ```
//!
//! Each producer gets its own player; a producer thread pushes while the
//! sink thread pulls at its own cadence. Packet numbers and presentation
//! times are modular, compared through [`seq`].
//!
//! The muxer, container observer, resampler and decoders are narrow seams:
//! see [`mux`], [`resample`] and [`video::decoder`].

pub mod audio;
pub mod codec;
pub mod mux;
pub mod packet;
pub mod registry;
pub mod resample;
pub mod seq;
pub mod stats;
pub mod video;

pub use audio::{AudioPlayer, AudioPlayerConfig, StereoMask};
pub use codec::{AudioCodec, CodecFamily, SpeexBandMode};
pub use mux::{AudioContainer, AudioMuxer, NullMuxer};
pub use packet::{AudioPacket, StreamType, VideoPacket};
pub use registry::PlayerRegistry;
pub use resample::{OutputResampler, RateConverter};
pub use video::{DecodedVideoFrame, VideoPlayer, VideoPlayerConfig, Vp8Decoder};
