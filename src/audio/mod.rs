pub mod fragment;
pub mod player;

pub use fragment::FragmentStore;
pub use player::{AudioPlayer, AudioPlayerConfig, StereoMask};
