//! Parsed media packets as delivered by the transport.
//!
//! The transport hands over fully parsed packet structures; nothing here
//! touches the wire format. Payloads are reference-counted [`Bytes`] so a
//! reassembled packet can be handed back to the caller without copying.

use bytes::Bytes;

/// What kind of stream a player is receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Voice,
    MediaFileAudio,
    Video,
}

/// One audio packet from a producer.
///
/// `packet_no` is 16-bit modular. A packet is a fragment of a larger packet
/// when `fragment_count` announces more than one piece; `fragment_no` then
/// selects which piece this is.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub packet_no: u16,
    /// Talkspurt id. Zero is invalid and such packets are dropped.
    pub stream_id: u8,
    /// Capture timestamp in milliseconds.
    pub timestamp: u32,
    pub fragment_no: Option<u8>,
    pub fragment_count: Option<u8>,
    pub payload: Bytes,
    /// Per-frame byte sizes for codecs that pack several frames per packet.
    pub frame_sizes: Option<Vec<u16>>,
}

impl AudioPacket {
    /// True when this packet is one piece of a fragmented packet.
    pub fn has_fragments(&self) -> bool {
        self.fragment_count.map_or(false, |count| count > 1)
    }
}

/// One video packet from a producer.
///
/// `packet_no` and the presentation time are 32-bit modular. The first packet
/// of a stream additionally advertises the frame dimensions.
#[derive(Debug, Clone)]
pub struct VideoPacket {
    pub packet_no: u32,
    pub stream_id: u8,
    /// Presentation time in milliseconds.
    pub timestamp: u32,
    pub fragment_no: Option<u16>,
    pub fragment_count: Option<u16>,
    pub payload: Bytes,
    /// Frame width and height, carried by the first packet of a stream.
    pub dimensions: Option<(u16, u16)>,
}

impl VideoPacket {
    pub fn has_fragments(&self) -> bool {
        self.fragment_count.map_or(false, |count| count > 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_packet(fragment_no: Option<u8>, fragment_count: Option<u8>) -> AudioPacket {
        AudioPacket {
            packet_no: 1,
            stream_id: 1,
            timestamp: 0,
            fragment_no,
            fragment_count,
            payload: Bytes::from_static(&[0u8; 4]),
            frame_sizes: None,
        }
    }

    #[test]
    fn test_has_fragments() {
        assert!(!audio_packet(None, None).has_fragments());
        assert!(!audio_packet(Some(0), Some(1)).has_fragments());
        assert!(audio_packet(Some(0), Some(2)).has_fragments());
        // malformed: announces fragments but carries no fragment number
        assert!(audio_packet(None, Some(3)).has_fragments());
    }
}
