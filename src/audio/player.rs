//! Per-producer audio playback with jitter buffering.
//!
//! One [`AudioPlayer`] exists per (producer, stream type) pair. The network
//! thread pushes packets in whatever order they arrive; the sound sink pulls
//! one callback of PCM at a fixed cadence. In between sits a sequence-ordered
//! jitter buffer bounded by a millisecond budget.
//!
//! ```text
//! transport thread            sink thread
//!      push ──► fragments ──► jitter buffer ──► decode / conceal
//!                                                  │
//!                                  muxer ◄─────────┤ (pre-mask PCM)
//!                              container ◄─────────┤
//!                                                  ▼
//!                             stereo mask ─► simulate stereo ─► resample
//! ```
//!
//! Key behaviors:
//! - A missing slot at the play cursor runs the decoder's loss concealment
//!   instead of going silent, as long as newer audio is buffered.
//! - Pushing past the budget evicts the oldest slots and drags the play
//!   cursor forward; pulling applies a tighter budget to voice so latency
//!   catches up after a stall.
//! - A talkspurt ends when nothing has played for the configured delay; the
//!   muxer gets one final marker and the buffer resets to idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::codec::{AudioCodec, AudioFrameDecoder};
use crate::mux::{AudioContainer, AudioMuxer};
use crate::packet::{AudioPacket, StreamType};
use crate::resample::OutputResampler;
use crate::seq;
use crate::stats::Counter;

use super::fragment::FragmentStore;

pub const DEFAULT_BUFFER_MSEC: u32 = 1_000;
pub const DEFAULT_PLAY_STOPPED_DELAY: Duration = Duration::from_millis(500);
/// Pending reassembly sets tolerated before fragments expire by distance.
pub const DEFAULT_FRAGMENT_WINDOW: u16 = 10;

/// Which lanes of a stereo callback are audible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoMask {
    Both,
    Left,
    Right,
    None,
}

impl StereoMask {
    fn to_u8(self) -> u8 {
        match self {
            Self::Both => 0,
            Self::Left => 1,
            Self::Right => 2,
            Self::None => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Both,
            1 => Self::Left,
            2 => Self::Right,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioPlayerConfig {
    pub buffer_msec: u32,
    pub stereo: StereoMask,
    pub no_recording: bool,
    /// Idle time after which a talkspurt is declared over.
    pub play_stopped_delay: Duration,
    pub fragment_window: u16,
}

impl Default for AudioPlayerConfig {
    fn default() -> Self {
        Self {
            buffer_msec: DEFAULT_BUFFER_MSEC,
            stereo: StereoMask::Both,
            no_recording: false,
            play_stopped_delay: DEFAULT_PLAY_STOPPED_DELAY,
            fragment_window: DEFAULT_FRAGMENT_WINDOW,
        }
    }
}

/// One reassembled, validated packet waiting to be played.
struct BufferedAudioFrame {
    payload: Bytes,
    frame_sizes: Vec<u16>,
    timestamp: u32,
    stream_id: u8,
}

/// Shared between push and pull, guarded by the player mutex.
struct JitterState {
    buffer: HashMap<u16, BufferedAudioFrame>,
    fragments: FragmentStore,
    /// Next packet the sink will play. Advanced by the pull side, dragged
    /// forward by evictions.
    play_pkt_no: u16,
    /// Current talkspurt; zero while idle.
    stream_id: u8,
    played_packet_time: u32,
    decoder: AudioFrameDecoder,
    buffer_msec: u32,
}

/// Owned by the sink thread; the sink guarantees one pull at a time.
struct SinkState {
    work: Vec<i16>,
    resampler: Option<Box<dyn OutputResampler>>,
    samples_played: u64,
    current_samples_played: u64,
    last_playback: Instant,
}

pub struct AudioPlayer {
    sound_group: u32,
    user_id: u32,
    stream_type: StreamType,
    codec: AudioCodec,
    fragment_window: u16,
    jitter: Mutex<JitterState>,
    sink: Mutex<SinkState>,
    muxer: Arc<dyn AudioMuxer>,
    container: Option<Arc<dyn AudioContainer>>,
    stereo: AtomicU8,
    no_recording: AtomicBool,
    play_stopped_delay_ms: AtomicU32,
    talking: AtomicBool,
    received: Counter,
    lost: Counter,
    dropped: Counter,
    new_audio_blocks: Counter,
}

impl AudioPlayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sound_group: u32,
        user_id: u32,
        stream_type: StreamType,
        codec: AudioCodec,
        muxer: Arc<dyn AudioMuxer>,
        container: Option<Arc<dyn AudioContainer>>,
        resampler: Option<Box<dyn OutputResampler>>,
        config: AudioPlayerConfig,
    ) -> Result<Self> {
        debug!("New audio player for user {}", user_id);

        let decoder = AudioFrameDecoder::new(&codec)?;
        let work_len = codec.callback_samples as usize * codec.output_channels() as usize;

        Ok(Self {
            sound_group,
            user_id,
            stream_type,
            codec,
            fragment_window: config.fragment_window,
            jitter: Mutex::new(JitterState {
                buffer: HashMap::new(),
                fragments: FragmentStore::new(),
                play_pkt_no: 0,
                stream_id: 0,
                played_packet_time: 0,
                decoder,
                buffer_msec: config.buffer_msec.max(codec.callback_millis),
            }),
            sink: Mutex::new(SinkState {
                work: vec![0; work_len],
                resampler,
                samples_played: 0,
                current_samples_played: 0,
                last_playback: Instant::now(),
            }),
            muxer,
            container,
            stereo: AtomicU8::new(config.stereo.to_u8()),
            no_recording: AtomicBool::new(config.no_recording),
            play_stopped_delay_ms: AtomicU32::new(config.play_stopped_delay.as_millis() as u32),
            talking: AtomicBool::new(false),
            received: Counter::new(),
            lost: Counter::new(),
            dropped: Counter::new(),
            new_audio_blocks: Counter::new(),
        })
    }

    /// Accepts one packet from the transport.
    ///
    /// A fragment is held until its packet completes; the completed packet is
    /// both admitted and returned so the caller can inspect it.
    pub fn push(&self, packet: AudioPacket) -> Option<AudioPacket> {
        let mut jitter = self.jitter.lock().unwrap();

        let (packet, reassembled) = if packet.has_fragments() {
            if packet.fragment_no.is_none() {
                trace!(
                    "User {}, fragmented packet {} with no fragment number",
                    self.user_id,
                    packet.packet_no
                );
                return None;
            }

            // eject fragment sets playback has already moved past
            let too_old = if jitter.fragments.len() >= self.fragment_window as usize {
                packet.packet_no.wrapping_sub(self.fragment_window)
            } else {
                jitter.play_pkt_no
            };
            if too_old != 0 {
                jitter.fragments.expire_older(too_old);
            }

            match jitter.fragments.insert(packet) {
                Some(whole) => {
                    let out = whole.clone();
                    (whole, Some(out))
                }
                None => return None,
            }
        } else {
            (packet, None)
        };

        self.admit(&mut jitter, packet);
        reassembled
    }

    fn admit(&self, jitter: &mut JitterState, packet: AudioPacket) {
        if packet.payload.is_empty() {
            return;
        }
        self.received.incr();

        let pkt_no = packet.packet_no;
        let stream_id = packet.stream_id;

        if stream_id == 0 {
            trace!("Received stream id 0 from user {}, packet {}", self.user_id, pkt_no);
            return;
        }
        if jitter.stream_id != 0 && seq::lt16(pkt_no, jitter.play_pkt_no) {
            debug!("User {}, packet {} arrived too late", self.user_id, pkt_no);
            return;
        }

        let frame_sizes = match packet.frame_sizes {
            Some(sizes) => {
                let sum: usize = sizes.iter().map(|&s| usize::from(s)).sum();
                if sum != packet.payload.len() {
                    warn!(
                        "User {}, sum of frame sizes didn't match, {} != {}",
                        self.user_id,
                        sum,
                        packet.payload.len()
                    );
                    jitter.buffer.remove(&pkt_no);
                    self.dropped.incr();
                    return;
                }
                sizes
            }
            None => {
                if self.codec.frames_per_packet > 1 {
                    vec![self.codec.encoded_frame_size; self.codec.frames_per_packet as usize]
                } else {
                    vec![packet.payload.len() as u16]
                }
            }
        };

        if jitter.buffer.contains_key(&pkt_no) {
            trace!("User {}, duplicate packet {}", self.user_id, pkt_no);
        }
        jitter.buffer.insert(
            pkt_no,
            BufferedAudioFrame {
                payload: packet.payload,
                frame_sizes,
                timestamp: packet.timestamp,
                stream_id,
            },
        );

        // keep the buffered span inside the budget
        while Self::buffered_msec_of(&self.codec, jitter) > jitter.buffer_msec
            && !jitter.buffer.is_empty()
        {
            let oldest =
                seq::min_from16(jitter.play_pkt_no, jitter.buffer.keys().copied()).unwrap();
            debug!(
                "User {}, removing packet {} to limit buffer to {} msec",
                self.user_id, oldest, jitter.buffer_msec
            );
            jitter.buffer.remove(&oldest);
            self.dropped.incr();
            if let Some(next) =
                seq::min_from16(jitter.play_pkt_no, jitter.buffer.keys().copied())
            {
                jitter.play_pkt_no = next;
            }
        }

        if jitter.stream_id == 0 {
            jitter.play_pkt_no = pkt_no;
            jitter.stream_id = stream_id;
        }
    }

    /// Produces one callback of PCM for the sink.
    ///
    /// Returns true when a buffered slot was consumed, by decoding it or by
    /// concealing its loss. Returns false when the buffer was empty and
    /// silence was written.
    pub fn pull(&self, output: &mut [i16], output_samples: usize) -> bool {
        let mut sink = self.sink.lock().unwrap();
        let sink = &mut *sink;

        let in_channels = self.codec.channels as usize;
        let out_channels = self.codec.output_channels() as usize;
        let cb_samples = self.codec.callback_samples as usize;
        let decode_len = cb_samples * in_channels;

        let (played, stream_id) = {
            let mut jitter = self.jitter.lock().unwrap();
            let jitter = &mut *jitter;

            if !jitter.buffer.is_empty() {
                // voice runs on half the budget so latency catches up
                let maxbuf_msec = match self.stream_type {
                    StreamType::Voice => jitter.buffer_msec / 2,
                    _ => jitter.buffer_msec,
                };

                while jitter.stream_id != 0
                    && Self::buffered_msec_of(&self.codec, jitter) > maxbuf_msec
                {
                    let Some(oldest) =
                        seq::min_from16(jitter.play_pkt_no, jitter.buffer.keys().copied())
                    else {
                        break;
                    };
                    debug!("User {}, dropped packet {} to catch up", self.user_id, oldest);
                    jitter.buffer.remove(&oldest);
                    self.dropped.incr();
                    if let Some(next) =
                        seq::min_from16(jitter.play_pkt_no, jitter.buffer.keys().copied())
                    {
                        jitter.play_pkt_no = next;
                    }
                }
            }

            if !jitter.buffer.is_empty() {
                match jitter.buffer.remove(&jitter.play_pkt_no) {
                    Some(frame) => {
                        jitter.decoder.decode(
                            Some((&frame.payload, &frame.frame_sizes)),
                            &mut sink.work[..decode_len],
                            cb_samples,
                        );
                        jitter.played_packet_time = frame.timestamp;
                        if jitter.stream_id != frame.stream_id {
                            debug!(
                                "User {} started new audio stream {}",
                                self.user_id, frame.stream_id
                            );
                        }
                        jitter.stream_id = frame.stream_id;
                    }
                    None => {
                        debug!("User {} is missing packet {}", self.user_id, jitter.play_pkt_no);
                        jitter
                            .decoder
                            .decode(None, &mut sink.work[..decode_len], cb_samples);
                        self.lost.incr();
                    }
                }
                jitter.play_pkt_no = jitter.play_pkt_no.wrapping_add(1);
                (true, jitter.stream_id)
            } else {
                sink.work[..cb_samples * out_channels].fill(0);
                (false, jitter.stream_id)
            }
        };

        // recording taps see the working buffer before any lane shaping
        let no_recording = self.no_recording.load(Ordering::Relaxed);
        if !(no_recording && played) {
            let pcm = played.then_some(&sink.work[..decode_len]);
            self.muxer
                .queue_user_audio(self.user_id, pcm, sink.samples_played, false, &self.codec);
        }

        if played {
            sink.last_playback = Instant::now();
            self.talking.store(true, Ordering::Relaxed);
        } else if self.talking.load(Ordering::Relaxed) {
            let delay = Duration::from_millis(
                u64::from(self.play_stopped_delay_ms.load(Ordering::Relaxed)),
            );
            if sink.last_playback.elapsed() >= delay {
                debug!("Stopped playing stream for user {}", self.user_id);
                self.talking.store(false, Ordering::Relaxed);
                self.muxer
                    .queue_user_audio(self.user_id, None, sink.samples_played, true, &self.codec);
                self.reset();
            }
        }

        if self.talking.load(Ordering::Relaxed) {
            if !no_recording {
                if let Some(container) = &self.container {
                    let accepted = container.add_audio(
                        self.sound_group,
                        self.user_id,
                        self.stream_type,
                        stream_id,
                        self.codec.sample_rate,
                        self.codec.channels,
                        &sink.work[..decode_len],
                        cb_samples,
                        sink.current_samples_played,
                    );
                    if accepted {
                        self.new_audio_blocks.incr();
                    }
                }
            }
            sink.current_samples_played += cb_samples as u64;
        } else {
            sink.current_samples_played = 0;
        }

        // lane selection for stereo callbacks
        if self.codec.channels == 2 {
            match self.stereo_mask() {
                StereoMask::Both => {}
                StereoMask::Left => {
                    for frame in sink.work[..decode_len].chunks_exact_mut(2) {
                        frame[1] = 0;
                    }
                }
                StereoMask::Right => {
                    for frame in sink.work[..decode_len].chunks_exact_mut(2) {
                        frame[0] = 0;
                    }
                }
                StereoMask::None => sink.work[..decode_len].fill(0),
            }
        }

        // mono codecs that promised the sink a stereo callback
        if self.codec.simulate_stereo {
            for i in (0..cb_samples).rev() {
                let s = sink.work[i];
                sink.work[2 * i] = s;
                sink.work[2 * i + 1] = s;
            }
        }

        let out_len = cb_samples * out_channels;
        match &mut sink.resampler {
            Some(resampler) => {
                let produced =
                    resampler.resample(&sink.work[..out_len], cb_samples, output, output_samples);
                if produced != output_samples {
                    trace!(
                        "Resampler produced {} of {} samples",
                        produced,
                        output_samples
                    );
                }
            }
            None => {
                let n = out_len.min(output.len());
                output[..n].copy_from_slice(&sink.work[..n]);
            }
        }

        sink.samples_played += cb_samples as u64;

        played
    }

    /// Best-effort estimate of buffered audio for flow control.
    pub fn buffered_msec(&self) -> u32 {
        let jitter = self.jitter.lock().unwrap();
        Self::buffered_msec_of(&self.codec, &jitter)
    }

    fn buffered_msec_of(codec: &AudioCodec, jitter: &JitterState) -> u32 {
        let cb_msec = codec.callback_millis;
        if jitter.stream_id != 0 && !jitter.buffer.is_empty() && cb_msec != 0 {
            let highest =
                seq::max_from16(jitter.play_pkt_no, jitter.buffer.keys().copied()).unwrap();
            let span = u32::from(highest.wrapping_sub(jitter.play_pkt_no)) + 1;
            cb_msec * span
        } else {
            jitter.buffer.len() as u32 * cb_msec
        }
    }

    /// Flushes all buffered audio and returns to idle.
    ///
    /// The last-playback instant survives so the owner can measure how long
    /// the player has been inactive.
    pub fn reset(&self) {
        let mut jitter = self.jitter.lock().unwrap();
        jitter.fragments.clear();
        jitter.buffer.clear();
        jitter.play_pkt_no = 0;
        jitter.stream_id = 0;
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn codec(&self) -> &AudioCodec {
        &self.codec
    }

    pub fn is_talking(&self) -> bool {
        self.talking.load(Ordering::Relaxed)
    }

    pub fn stream_id(&self) -> u8 {
        self.jitter.lock().unwrap().stream_id
    }

    pub fn play_packet_no(&self) -> u16 {
        self.jitter.lock().unwrap().play_pkt_no
    }

    /// Timestamp of the last packet that actually decoded. Concealed slots do
    /// not advance it.
    pub fn played_packet_time(&self) -> u32 {
        self.jitter.lock().unwrap().played_packet_time
    }

    /// Instant of the last callback that played audio.
    pub fn last_playback(&self) -> Instant {
        self.sink.lock().unwrap().last_playback
    }

    pub fn set_buffer_msec(&self, msec: u32) {
        let mut jitter = self.jitter.lock().unwrap();
        jitter.buffer_msec = msec.max(self.codec.callback_millis);
    }

    pub fn stereo_mask(&self) -> StereoMask {
        StereoMask::from_u8(self.stereo.load(Ordering::Relaxed))
    }

    pub fn set_stereo_mask(&self, mask: StereoMask) {
        self.stereo.store(mask.to_u8(), Ordering::Relaxed);
    }

    pub fn set_no_recording(&self, no_recording: bool) {
        self.no_recording.store(no_recording, Ordering::Relaxed);
    }

    pub fn set_play_stopped_delay(&self, delay: Duration) {
        self.play_stopped_delay_ms
            .store(delay.as_millis() as u32, Ordering::Relaxed);
    }

    pub fn packets_received(&self, reset: bool) -> u64 {
        self.received.get(reset)
    }

    pub fn packets_lost(&self, reset: bool) -> u64 {
        self.lost.get(reset)
    }

    /// Slots discarded without being played: budget and catch-up evictions
    /// and frame-size rejects. Concealed losses count under `packets_lost`.
    pub fn packets_dropped(&self, reset: bool) -> u64 {
        self.dropped.get(reset)
    }

    /// Blocks the container accepted since the last reset of this counter.
    pub fn audio_blocks(&self, reset: bool) -> u64 {
        self.new_audio_blocks.get(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::NullMuxer;
    use opus::{Application, Channels as OpusChannels, Encoder};
    use std::sync::atomic::AtomicU64;

    struct MuxCall {
        had_pcm: bool,
        stream_ended: bool,
    }

    #[derive(Default)]
    struct RecordingMuxer {
        calls: Mutex<Vec<MuxCall>>,
    }

    impl AudioMuxer for RecordingMuxer {
        fn queue_user_audio(
            &self,
            _user_id: u32,
            pcm: Option<&[i16]>,
            _sample_no: u64,
            stream_ended: bool,
            _codec: &AudioCodec,
        ) {
            self.calls.lock().unwrap().push(MuxCall {
                had_pcm: pcm.is_some(),
                stream_ended,
            });
        }
    }

    #[derive(Default)]
    struct CountingContainer {
        accepted: AtomicU64,
    }

    impl AudioContainer for CountingContainer {
        fn add_audio(
            &self,
            _sound_group: u32,
            _user_id: u32,
            _stream_type: StreamType,
            stream_id: u8,
            _sample_rate: u32,
            _channels: u8,
            _pcm: &[i16],
            _n_samples: usize,
            _sample_no: u64,
        ) -> bool {
            assert_ne!(stream_id, 0);
            self.accepted.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    /// Builds real Opus packets so pulls exercise the actual decoder.
    struct PacketSource {
        encoder: Encoder,
    }

    impl PacketSource {
        fn new_mono() -> Self {
            Self {
                encoder: Encoder::new(48_000, OpusChannels::Mono, Application::Voip).unwrap(),
            }
        }

        fn packet(&mut self, packet_no: u16, stream_id: u8, timestamp: u32) -> AudioPacket {
            let pcm: Vec<i16> = (0..960)
                .map(|i| ((i as f32 * 0.03).sin() * 9_000.0) as i16)
                .collect();
            let mut buf = vec![0u8; 4_000];
            let len = self.encoder.encode(&pcm, &mut buf).unwrap();
            AudioPacket {
                packet_no,
                stream_id,
                timestamp,
                fragment_no: None,
                fragment_count: None,
                payload: Bytes::copy_from_slice(&buf[..len]),
                frame_sizes: None,
            }
        }
    }

    fn opus_codec() -> AudioCodec {
        AudioCodec::opus(48_000, 1, 20)
    }

    fn player_with(muxer: Arc<dyn AudioMuxer>, config: AudioPlayerConfig) -> AudioPlayer {
        AudioPlayer::new(0, 7, StreamType::Voice, opus_codec(), muxer, None, None, config)
            .unwrap()
    }

    fn voice_player() -> AudioPlayer {
        player_with(Arc::new(NullMuxer), AudioPlayerConfig::default())
    }

    #[test]
    fn test_clean_voice_plays_in_order() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        for no in 100..110u16 {
            assert!(player.push(source.packet(no, 7, u32::from(no) * 20)).is_none());
        }

        let mut out = vec![0i16; 960];
        for _ in 0..10 {
            assert!(player.pull(&mut out, 960));
        }

        assert_eq!(player.packets_received(false), 10);
        assert_eq!(player.packets_lost(false), 0);
        assert_eq!(player.play_packet_no(), 110);
        assert_eq!(player.stream_id(), 7);
        assert!(player.is_talking());
    }

    #[test]
    fn test_single_loss_is_concealed() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        for no in 100..110u16 {
            if no == 104 {
                continue;
            }
            player.push(source.packet(no, 7, u32::from(no) * 20));
        }

        let mut out = vec![0i16; 960];
        for _ in 0..10 {
            assert!(player.pull(&mut out, 960));
        }

        assert_eq!(player.packets_received(false), 9);
        assert_eq!(player.packets_lost(false), 1);
        assert_eq!(player.play_packet_no(), 110);
    }

    #[test]
    fn test_concealment_happens_at_most_once_per_slot() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        player.push(source.packet(10, 2, 200));
        player.push(source.packet(12, 2, 240));

        let mut out = vec![0i16; 960];
        assert!(player.pull(&mut out, 960)); // 10 decoded
        assert!(player.pull(&mut out, 960)); // 11 concealed
        assert!(player.pull(&mut out, 960)); // 12 decoded
        assert!(!player.pull(&mut out, 960)); // empty, silence

        assert_eq!(player.packets_lost(false), 1);
    }

    #[test]
    fn test_fragmented_packet_reassembles_and_plays() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        let whole = source.packet(42, 5, 8_888);
        let payload = whole.payload.clone();
        let (first, second) = payload.split_at(payload.len() / 2);

        let fragment = |no: u8, data: &[u8]| AudioPacket {
            packet_no: 42,
            stream_id: 5,
            timestamp: 8_888,
            fragment_no: Some(no),
            fragment_count: Some(2),
            payload: Bytes::copy_from_slice(data),
            frame_sizes: None,
        };

        assert!(player.push(fragment(0, first)).is_none());
        let reassembled = player.push(fragment(1, second)).expect("completes the packet");
        assert_eq!(&reassembled.payload[..], &payload[..]);
        assert_eq!(player.packets_received(false), 1);

        let mut out = vec![0i16; 960];
        assert!(player.pull(&mut out, 960));
        assert_eq!(player.played_packet_time(), 8_888);
    }

    #[test]
    fn test_malformed_fragment_is_dropped() {
        let player = voice_player();
        let packet = AudioPacket {
            packet_no: 9,
            stream_id: 5,
            timestamp: 0,
            fragment_no: None,
            fragment_count: Some(2),
            payload: Bytes::from_static(&[1, 2, 3]),
            frame_sizes: None,
        };
        assert!(player.push(packet).is_none());
        assert_eq!(player.buffered_msec(), 0);
    }

    #[test]
    fn test_budget_eviction_on_push() {
        let config = AudioPlayerConfig {
            buffer_msec: 200,
            ..Default::default()
        };
        let player = player_with(Arc::new(NullMuxer), config);
        let mut source = PacketSource::new_mono();

        for no in 1..=20u16 {
            player.push(source.packet(no, 2, u32::from(no) * 20));
            // never more than one callback over the budget
            assert!(player.buffered_msec() <= 200 + 20);
        }

        assert!(player.buffered_msec() <= 200);
        assert_eq!(player.play_packet_no(), 11);
        assert_eq!(player.packets_dropped(false), 10);
    }

    #[test]
    fn test_catch_up_eviction_on_pull() {
        let config = AudioPlayerConfig {
            buffer_msec: 200,
            ..Default::default()
        };
        let player = player_with(Arc::new(NullMuxer), config);
        let mut source = PacketSource::new_mono();

        // exactly the push budget, so nothing is evicted on the way in
        for no in 1..=10u16 {
            player.push(source.packet(no, 2, u32::from(no) * 20));
        }
        assert_eq!(player.packets_dropped(false), 0);

        // voice pulls against half the budget: 1..=5 go, 6 plays
        let mut out = vec![0i16; 960];
        assert!(player.pull(&mut out, 960));
        assert_eq!(player.play_packet_no(), 7);
        assert_eq!(player.packets_dropped(false), 5);
        assert_eq!(player.buffered_msec(), 80);
        assert_eq!(player.packets_lost(false), 0);
    }

    #[test]
    fn test_talkspurt_end_sends_final_marker() {
        let muxer = Arc::new(RecordingMuxer::default());
        let config = AudioPlayerConfig {
            play_stopped_delay: Duration::from_millis(30),
            ..Default::default()
        };
        let player = AudioPlayer::new(
            0,
            7,
            StreamType::Voice,
            opus_codec(),
            muxer.clone(),
            None,
            None,
            config,
        )
        .unwrap();

        let mut source = PacketSource::new_mono();
        for no in 0..3u16 {
            player.push(source.packet(no, 4, u32::from(no) * 20));
        }

        let mut out = vec![0i16; 960];
        for _ in 0..3 {
            assert!(player.pull(&mut out, 960));
        }
        assert!(player.is_talking());

        assert!(!player.pull(&mut out, 960));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!player.pull(&mut out, 960));

        assert!(!player.is_talking());
        assert_eq!(player.stream_id(), 0);

        let calls = muxer.calls.lock().unwrap();
        let finals: Vec<_> = calls.iter().filter(|c| c.stream_ended).collect();
        assert_eq!(finals.len(), 1);
        assert!(!finals[0].had_pcm);
    }

    #[test]
    fn test_playback_across_sequence_wrap() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        let numbers: Vec<u16> = (0..12).map(|i| 65_530u16.wrapping_add(i)).collect();
        for (i, &no) in numbers.iter().enumerate() {
            player.push(source.packet(no, 6, i as u32 * 20));
        }

        let mut out = vec![0i16; 960];
        for _ in 0..numbers.len() {
            assert!(player.pull(&mut out, 960));
        }

        assert_eq!(player.play_packet_no(), 6);
        assert_eq!(player.packets_lost(false), 0);
    }

    #[test]
    fn test_new_talkspurt_after_reset() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        for no in 10..13u16 {
            player.push(source.packet(no, 1, u32::from(no) * 20));
        }
        let mut out = vec![0i16; 960];
        for _ in 0..3 {
            assert!(player.pull(&mut out, 960));
        }

        player.reset();
        assert_eq!(player.stream_id(), 0);

        for no in 500..503u16 {
            player.push(source.packet(no, 9, u32::from(no) * 20));
        }
        assert_eq!(player.play_packet_no(), 500);
        for _ in 0..3 {
            assert!(player.pull(&mut out, 960));
        }
        assert_eq!(player.stream_id(), 9);
        assert_eq!(player.play_packet_no(), 503);
    }

    #[test]
    fn test_zero_stream_id_is_dropped() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        player.push(source.packet(1, 0, 0));

        assert_eq!(player.buffered_msec(), 0);
        let mut out = vec![0i16; 960];
        assert!(!player.pull(&mut out, 960));
    }

    #[test]
    fn test_late_packet_is_dropped() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        for no in 5..8u16 {
            player.push(source.packet(no, 3, u32::from(no) * 20));
        }
        let mut out = vec![0i16; 960];
        assert!(player.pull(&mut out, 960));
        assert!(player.pull(&mut out, 960));

        // play cursor is at 7 now; 5 must not be re-admitted
        player.push(source.packet(5, 3, 100));
        assert_eq!(player.buffered_msec(), 20);
        assert!(player.pull(&mut out, 960));
        assert!(!player.pull(&mut out, 960));
    }

    #[test]
    fn test_container_counts_accepted_blocks() {
        let container = Arc::new(CountingContainer::default());
        let player = AudioPlayer::new(
            1,
            7,
            StreamType::Voice,
            opus_codec(),
            Arc::new(NullMuxer),
            Some(container.clone()),
            None,
            AudioPlayerConfig::default(),
        )
        .unwrap();

        let mut source = PacketSource::new_mono();
        for no in 0..2u16 {
            player.push(source.packet(no, 8, u32::from(no) * 20));
        }
        let mut out = vec![0i16; 960];
        for _ in 0..2 {
            player.pull(&mut out, 960);
        }

        assert_eq!(container.accepted.load(Ordering::Relaxed), 2);
        assert_eq!(player.audio_blocks(false), 2);
        assert_eq!(player.audio_blocks(true), 2);
        assert_eq!(player.audio_blocks(false), 0);
    }

    #[test]
    fn test_stereo_mask_mutes_selected_lane() {
        let codec = AudioCodec::opus(48_000, 2, 20);
        let player = AudioPlayer::new(
            0,
            7,
            StreamType::Voice,
            codec,
            Arc::new(NullMuxer),
            None,
            None,
            AudioPlayerConfig::default(),
        )
        .unwrap();
        player.set_stereo_mask(StereoMask::Left);

        let mut encoder = Encoder::new(48_000, OpusChannels::Stereo, Application::Voip).unwrap();
        let pcm: Vec<i16> = (0..960 * 2)
            .map(|i| ((i as f32 * 0.02).sin() * 10_000.0) as i16)
            .collect();
        let mut buf = vec![0u8; 4_000];
        let len = encoder.encode(&pcm, &mut buf).unwrap();
        player.push(AudioPacket {
            packet_no: 1,
            stream_id: 2,
            timestamp: 20,
            fragment_no: None,
            fragment_count: None,
            payload: Bytes::copy_from_slice(&buf[..len]),
            frame_sizes: None,
        });

        let mut out = vec![0i16; 960 * 2];
        assert!(player.pull(&mut out, 960));
        assert!(out.chunks_exact(2).all(|frame| frame[1] == 0));
        assert!(out.chunks_exact(2).any(|frame| frame[0] != 0));
    }

    #[test]
    fn test_simulated_stereo_duplicates_lanes() {
        let codec = AudioCodec::speex_cbr(crate::codec::SpeexBandMode::Narrow, 2, 20, true);
        let player = AudioPlayer::new(
            0,
            7,
            StreamType::Voice,
            codec,
            Arc::new(NullMuxer),
            None,
            None,
            AudioPlayerConfig::default(),
        )
        .unwrap();

        player.push(AudioPacket {
            packet_no: 1,
            stream_id: 2,
            timestamp: 40,
            fragment_no: None,
            fragment_count: None,
            payload: Bytes::from(vec![0u8; 40]),
            frame_sizes: None,
        });

        let mut out = vec![7i16; 320 * 2];
        assert!(player.pull(&mut out, 320));
        assert!(out.chunks_exact(2).all(|frame| frame[0] == frame[1]));
    }

    #[test]
    fn test_frame_size_mismatch_drops_slot() {
        let player = voice_player();
        let mut source = PacketSource::new_mono();
        let mut packet = source.packet(3, 2, 60);
        packet.frame_sizes = Some(vec![1]);
        player.push(packet);

        assert_eq!(player.buffered_msec(), 0);
        assert_eq!(player.packets_dropped(false), 1);
        assert_eq!(player.packets_dropped(true), 1);
        assert_eq!(player.packets_dropped(false), 0);
    }

    #[test]
    fn test_resampled_output_matches_sink_rate() {
        let resampler =
            crate::resample::RateConverter::new(48_000, 16_000, 960, 1).unwrap();
        let player = AudioPlayer::new(
            0,
            7,
            StreamType::Voice,
            opus_codec(),
            Arc::new(NullMuxer),
            None,
            Some(Box::new(resampler)),
            AudioPlayerConfig::default(),
        )
        .unwrap();

        let mut source = PacketSource::new_mono();
        player.push(source.packet(1, 2, 20));

        let mut out = vec![0i16; 320];
        assert!(player.pull(&mut out, 320));
        assert!(!player.pull(&mut out, 320));
    }
}
