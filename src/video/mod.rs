pub mod decoder;
pub mod player;

pub use decoder::{DecodeStatus, VideoDecoderBackend, Vp8Decoder};
pub use player::{DecodedVideoFrame, VideoPlayer, VideoPlayerConfig};
