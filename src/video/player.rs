//! Per-producer video playback.
//!
//! The transport pushes packets; complete frames land in a store keyed by
//! presentation time, and the renderer pulls the oldest frame whose time has
//! come. The decoder opens lazily on the first packet's advertised size and
//! restarts itself when the bitstream turns incompatible.
//!
//! Frames that fall more than a few seconds behind the newest one will never
//! be shown; the player gives up on them by advancing its packet cursor,
//! which also expires any fragments still waiting for those packets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::packet::VideoPacket;
use crate::seq;
use crate::stats::Counter;

use super::decoder::{DecodeStatus, VideoDecoderBackend};

pub const DEFAULT_MAX_FRAGMENT_SETS: usize = 3_000;
pub const DEFAULT_MAX_BUFFERED_FRAMES: usize = 3_000;
pub const DEFAULT_FRAME_MAX_AGE_MSEC: u32 = 5_000;

#[derive(Debug, Clone)]
pub struct VideoPlayerConfig {
    pub max_fragment_sets: usize,
    pub max_buffered_frames: usize,
    /// Frames older than this relative to the newest buffered frame are
    /// given up on.
    pub frame_max_age_msec: u32,
}

impl Default for VideoPlayerConfig {
    fn default() -> Self {
        Self {
            max_fragment_sets: DEFAULT_MAX_FRAGMENT_SETS,
            max_buffered_frames: DEFAULT_MAX_BUFFERED_FRAMES,
            frame_max_age_msec: DEFAULT_FRAME_MAX_AGE_MSEC,
        }
    }
}

/// A complete encoded frame waiting to be decoded.
struct BufferedVideoFrame {
    payload: Bytes,
    packet_no: u32,
}

/// One decoded frame ready for rendering.
pub struct DecodedVideoFrame {
    /// Interleaved RGB32, `width * height * 4` bytes.
    pub rgb32: Vec<u8>,
    pub width: u16,
    pub height: u16,
    /// Presentation time in milliseconds.
    pub timestamp: u32,
    pub stream_id: u8,
}

struct VideoState<D> {
    fragments: HashMap<u32, BTreeMap<u16, VideoPacket>>,
    frames: HashMap<u32, BufferedVideoFrame>,
    /// Highest packet number decoded or given up on.
    packet_no: u32,
    decoder: D,
    decoder_ready: bool,
    last_packet_at: Instant,
}

pub struct VideoPlayer<D: VideoDecoderBackend> {
    user_id: u32,
    stream_id: u8,
    config: VideoPlayerConfig,
    state: Mutex<VideoState<D>>,
    packets_received: Counter,
    frames_received: Counter,
    frames_lost: Counter,
    frames_dropped: Counter,
}

impl<D: VideoDecoderBackend> VideoPlayer<D> {
    pub fn new(user_id: u32, stream_id: u8, decoder: D, config: VideoPlayerConfig) -> Self {
        debug!("New video player for user {} stream {}", user_id, stream_id);
        Self {
            user_id,
            stream_id,
            config,
            state: Mutex::new(VideoState {
                fragments: HashMap::new(),
                frames: HashMap::new(),
                packet_no: 0,
                decoder,
                decoder_ready: false,
                last_packet_at: Instant::now(),
            }),
            packets_received: Counter::new(),
            frames_received: Counter::new(),
            frames_lost: Counter::new(),
            frames_dropped: Counter::new(),
        }
    }

    /// Accepts one packet. Returns true when it left a complete frame queued
    /// at its presentation time.
    pub fn push(&self, packet: &VideoPacket) -> bool {
        self.packets_received.incr();

        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        state.last_packet_at = Instant::now();

        if !state.decoder_ready {
            let Some((width, height)) = packet.dimensions else {
                trace!(
                    "User {}, video packet {} before stream header",
                    self.user_id,
                    packet.packet_no
                );
                return false;
            };
            if let Err(e) = state.decoder.open(width, height) {
                warn!("Failed to open video decoder: {:#}", e);
                return false;
            }
            debug!(
                "Starting new video stream {} for user {}. {}x{}",
                self.stream_id, self.user_id, width, height
            );
            state.packet_no = packet.packet_no;
            state.decoder_ready = true;
        }

        self.process_packet(state, packet);
        state.frames.contains_key(&packet.timestamp)
    }

    fn process_packet(&self, state: &mut VideoState<D>, packet: &VideoPacket) {
        let packet_no = packet.packet_no;
        if seq::lt32(packet_no, state.packet_no) {
            debug!(
                "Packet {} from user {} arrived too late, current is {}",
                packet_no, self.user_id, state.packet_no
            );
            return;
        }

        match packet.fragment_no {
            None => {
                if packet.payload.is_empty() {
                    return;
                }
                state.frames.insert(
                    packet.timestamp,
                    BufferedVideoFrame {
                        payload: packet.payload.clone(),
                        packet_no,
                    },
                );
                self.frames_received.incr();
            }
            Some(fragment_no) => {
                let set = state.fragments.entry(packet_no).or_default();
                set.insert(fragment_no, packet.clone());

                if let Some(count) = packet.fragment_count {
                    let complete = set.len() >= count as usize
                        && (0..count).all(|no| set.contains_key(&no));
                    if complete {
                        let set = state.fragments.remove(&packet_no).unwrap();
                        let mut payload = Vec::new();
                        for fragment in set.values() {
                            payload.extend_from_slice(&fragment.payload);
                        }
                        state.frames.insert(
                            packet.timestamp,
                            BufferedVideoFrame {
                                payload: Bytes::from(payload),
                                packet_no,
                            },
                        );
                        self.frames_received.incr();
                    }
                }

                if state.fragments.len() > self.config.max_fragment_sets {
                    if let Some(oldest) = seq::min32(state.fragments.keys().copied()) {
                        debug!("Dropped fragmented video packet {}", oldest);
                        state.fragments.remove(&oldest);
                    }
                }
            }
        }

        if state.frames.len() > self.config.max_buffered_frames {
            if let Some(oldest) = seq::min32(state.frames.keys().copied()) {
                debug!("Dropped video frame at {}", oldest);
                state.frames.remove(&oldest);
            }
        }

        // give up on frames that fell too far behind the newest one
        if state.frames.len() > 2 {
            let times = seq::sorted32(state.frames.keys().copied());
            let newest = *times.last().unwrap();
            for &time in &times[..times.len() - 1] {
                if seq::lt32(time.wrapping_add(self.config.frame_max_age_msec), newest) {
                    state.packet_no = state.frames[&time].packet_no;
                    debug!(
                        "Video frame at {} is too old, cursor moved to packet {}",
                        time, state.packet_no
                    );
                } else {
                    break;
                }
            }
        }

        self.remove_obsolete(state);
    }

    fn remove_obsolete(&self, state: &mut VideoState<D>) {
        while let Some(oldest) = seq::min32(state.fragments.keys().copied()) {
            if !seq::leq32(oldest, state.packet_no) {
                break;
            }
            self.frames_lost
                .add(u64::from(state.packet_no.wrapping_sub(oldest)));
            state.fragments.remove(&oldest);
        }

        let cursor = state.packet_no;
        state
            .frames
            .retain(|_, frame| !seq::lt32(frame.packet_no, cursor));
    }

    /// Decodes and returns the frame with the smallest presentation time, as
    /// long as that time is not past `horizon`. `None` when nothing is due or
    /// the frame had to be dropped.
    pub fn pull_next(&self, horizon: Option<u32>) -> Option<DecodedVideoFrame> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        if !state.decoder_ready || state.frames.is_empty() {
            return None;
        }

        let timestamp = seq::min32(state.frames.keys().copied())?;
        if let Some(horizon) = horizon {
            if seq::gt32(timestamp, horizon) {
                return None;
            }
        }

        let (frame_packet_no, status) = {
            let frame = state.frames.get(&timestamp)?;
            (frame.packet_no, state.decoder.decode(&frame.payload))
        };

        match status {
            DecodeStatus::UnsupportedBitstream => {
                debug!(
                    "Unsupported bitstream in packet {} for user {}, restarting decoder",
                    frame_packet_no, self.user_id
                );
                let (width, height) = state.decoder.dimensions();
                state.decoder.close();
                if let Err(e) = state.decoder.open(width, height) {
                    warn!("Failed to reopen video decoder: {:#}", e);
                }
                state.packet_no = frame_packet_no;
                state.frames.remove(&timestamp);
                self.frames_dropped.incr();
                return None;
            }
            DecodeStatus::Failed => {
                warn!(
                    "Video decoder reported an error in packet {} for user {}",
                    frame_packet_no, self.user_id
                );
                state.packet_no = frame_packet_no;
                state.frames.remove(&timestamp);
                self.frames_dropped.incr();
                return None;
            }
            DecodeStatus::Ok => {}
        }

        state.packet_no = frame_packet_no;
        state.frames.remove(&timestamp);
        self.remove_obsolete(state);

        let (width, height) = state.decoder.dimensions();
        let mut rgb32 = vec![0u8; usize::from(width) * usize::from(height) * 4];
        // drain everything the decoder buffered; the newest image wins
        while state.decoder.next_rgb32(&mut rgb32) {}

        Some(DecodedVideoFrame {
            rgb32,
            width,
            height,
            timestamp,
            stream_id: self.stream_id,
        })
    }

    /// Presentation time of the next frame, for scheduler pacing.
    pub fn peek_next_time(&self) -> Option<u32> {
        let state = self.state.lock().unwrap();
        seq::min32(state.frames.keys().copied())
    }

    /// Current decoded dimensions once the decoder has started.
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        let state = self.state.lock().unwrap();
        state.decoder_ready.then(|| state.decoder.dimensions())
    }

    /// Instant of the last received packet, for owner-side idle cleanup.
    pub fn last_packet_at(&self) -> Instant {
        self.state.lock().unwrap().last_packet_at
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }

    pub fn packets_received_count(&self, reset: bool) -> u64 {
        self.packets_received.get(reset)
    }

    pub fn frames_received_count(&self, reset: bool) -> u64 {
        self.frames_received.get(reset)
    }

    pub fn frames_lost_count(&self, reset: bool) -> u64 {
        self.frames_lost.get(reset)
    }

    pub fn frames_dropped_count(&self, reset: bool) -> u64 {
        self.frames_dropped.get(reset)
    }
}
