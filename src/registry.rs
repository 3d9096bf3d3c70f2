//! Per-producer audio player registry.
//!
//! Each (producer, stream type) pair gets its own [`AudioPlayer`], created
//! when the first valid packet from that producer shows up. The transport
//! thread routes packets through [`PlayerRegistry::push_audio`] while the
//! sink side iterates the players for mixing. Producers that go quiet are
//! reaped by [`PlayerRegistry::cleanup_stale`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::{DashMap, Entry};
use tracing::info;

use crate::audio::{AudioPlayer, AudioPlayerConfig};
use crate::codec::AudioCodec;
use crate::mux::{AudioContainer, AudioMuxer};
use crate::packet::{AudioPacket, StreamType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PlayerKey {
    user_id: u32,
    stream_type: StreamType,
}

struct PlayerEntry {
    player: Arc<AudioPlayer>,
    last_seen: Instant,
}

pub struct PlayerRegistry {
    sound_group: u32,
    players: DashMap<PlayerKey, PlayerEntry>,
    muxer: Arc<dyn AudioMuxer>,
    container: Option<Arc<dyn AudioContainer>>,
    config: AudioPlayerConfig,
}

impl PlayerRegistry {
    pub fn new(
        sound_group: u32,
        muxer: Arc<dyn AudioMuxer>,
        container: Option<Arc<dyn AudioContainer>>,
        config: AudioPlayerConfig,
    ) -> Self {
        Self {
            sound_group,
            players: DashMap::new(),
            muxer,
            container,
            config,
        }
    }

    /// Routes one packet to its producer's player, creating the player on the
    /// first valid packet. Returns the reassembled packet when this push
    /// completed one.
    pub fn push_audio(
        &self,
        user_id: u32,
        stream_type: StreamType,
        codec: &AudioCodec,
        packet: AudioPacket,
    ) -> Result<Option<AudioPacket>> {
        if packet.stream_id == 0 {
            return Ok(None);
        }

        let key = PlayerKey {
            user_id,
            stream_type,
        };

        let mut entry = match self.players.entry(key) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => {
                let player = Arc::new(AudioPlayer::new(
                    self.sound_group,
                    user_id,
                    stream_type,
                    *codec,
                    self.muxer.clone(),
                    self.container.clone(),
                    None,
                    self.config.clone(),
                )?);
                info!("Creating audio player for user {} {:?}", user_id, stream_type);
                vacant.insert(PlayerEntry {
                    player,
                    last_seen: Instant::now(),
                })
            }
        };

        entry.last_seen = Instant::now();
        Ok(entry.player.push(packet))
    }

    pub fn player(&self, user_id: u32, stream_type: StreamType) -> Option<Arc<AudioPlayer>> {
        let key = PlayerKey {
            user_id,
            stream_type,
        };
        self.players.get(&key).map(|entry| entry.player.clone())
    }

    /// Snapshot of all players, for the sink side to mix from.
    pub fn players(&self) -> Vec<Arc<AudioPlayer>> {
        self.players
            .iter()
            .map(|entry| entry.player.clone())
            .collect()
    }

    /// Drops all players belonging to a producer that left.
    pub fn remove_user(&self, user_id: u32) {
        self.players.retain(|key, _| key.user_id != user_id);
    }

    /// Drops players that have not received a packet within `timeout`.
    pub fn cleanup_stale(&self, timeout: Duration) {
        let now = Instant::now();
        self.players.retain(|key, entry| {
            let alive = now.duration_since(entry.last_seen) < timeout;
            if !alive {
                info!(
                    "Removing stale audio player for user {} {:?}",
                    key.user_id, key.stream_type
                );
            }
            alive
        });
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::NullMuxer;
    use bytes::Bytes;

    fn registry() -> PlayerRegistry {
        PlayerRegistry::new(
            0,
            Arc::new(NullMuxer),
            None,
            AudioPlayerConfig::default(),
        )
    }

    fn packet(packet_no: u16, stream_id: u8) -> AudioPacket {
        AudioPacket {
            packet_no,
            stream_id,
            timestamp: u32::from(packet_no) * 20,
            fragment_no: None,
            fragment_count: None,
            payload: Bytes::from_static(&[1, 2, 3, 4]),
            frame_sizes: None,
        }
    }

    #[test]
    fn test_player_created_on_first_valid_packet() {
        let registry = registry();
        let codec = AudioCodec::opus(48_000, 1, 20);

        assert_eq!(registry.player_count(), 0);
        registry
            .push_audio(9, StreamType::Voice, &codec, packet(1, 2))
            .unwrap();
        assert_eq!(registry.player_count(), 1);
        assert!(registry.player(9, StreamType::Voice).is_some());
        assert!(registry.player(9, StreamType::MediaFileAudio).is_none());

        // same producer, same stream type: same player
        registry
            .push_audio(9, StreamType::Voice, &codec, packet(2, 2))
            .unwrap();
        assert_eq!(registry.player_count(), 1);
    }

    #[test]
    fn test_zero_stream_id_creates_nothing() {
        let registry = registry();
        let codec = AudioCodec::opus(48_000, 1, 20);
        registry
            .push_audio(9, StreamType::Voice, &codec, packet(1, 0))
            .unwrap();
        assert_eq!(registry.player_count(), 0);
    }

    #[test]
    fn test_remove_user_drops_players() {
        let registry = registry();
        let codec = AudioCodec::opus(48_000, 1, 20);
        registry
            .push_audio(9, StreamType::Voice, &codec, packet(1, 2))
            .unwrap();
        registry
            .push_audio(8, StreamType::Voice, &codec, packet(1, 3))
            .unwrap();

        registry.remove_user(9);
        assert_eq!(registry.player_count(), 1);
        assert!(registry.player(8, StreamType::Voice).is_some());
    }

    #[test]
    fn test_cleanup_stale_reaps_idle_players() {
        let registry = registry();
        let codec = AudioCodec::opus(48_000, 1, 20);
        registry
            .push_audio(9, StreamType::Voice, &codec, packet(1, 2))
            .unwrap();

        registry.cleanup_stale(Duration::from_secs(60));
        assert_eq!(registry.player_count(), 1);

        std::thread::sleep(Duration::from_millis(10));
        registry.cleanup_stale(Duration::from_millis(1));
        assert_eq!(registry.player_count(), 0);
    }
}
