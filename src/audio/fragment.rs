//! Reassembly of fragmented audio packets.
//!
//! Packets larger than the transport's MTU arrive as numbered fragments.
//! Fragments are collected per packet number; once every piece is present
//! they are concatenated in fragment order into one synthetic packet.
//! Fragments of packets that playback has already moved past are ejected.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::debug;

use crate::packet::AudioPacket;
use crate::seq;

#[derive(Default)]
pub struct FragmentStore {
    slots: HashMap<u16, BTreeMap<u8, AudioPacket>>,
}

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Ejects every pending set at or before `too_old_packet_no`. Those
    /// packets were overtaken by newer audio and will never be played.
    pub fn expire_older(&mut self, too_old_packet_no: u16) {
        self.slots.retain(|&packet_no, _| {
            let stale = seq::leq16(packet_no, too_old_packet_no);
            if stale {
                debug!("Packet {} wasn't reassembled, ejected", packet_no);
            }
            !stale
        });
    }

    /// Stores one fragment. When this completes its packet, returns the
    /// reassembled packet and drops the set. Duplicate fragments overwrite
    /// their slot and change nothing else.
    pub fn insert(&mut self, packet: AudioPacket) -> Option<AudioPacket> {
        let packet_no = packet.packet_no;
        let fragment_no = packet.fragment_no?;
        let fragment_count = packet.fragment_count?;

        let set = self.slots.entry(packet_no).or_default();
        set.insert(fragment_no, packet);

        if set.len() < fragment_count as usize
            || !(0..fragment_count).all(|no| set.contains_key(&no))
        {
            return None;
        }

        let set = self.slots.remove(&packet_no)?;
        let first = set.get(&0)?;

        let mut payload = Vec::new();
        for fragment in set.values() {
            payload.extend_from_slice(&fragment.payload);
        }

        Some(AudioPacket {
            packet_no,
            stream_id: first.stream_id,
            timestamp: first.timestamp,
            fragment_no: None,
            fragment_count: None,
            payload: Bytes::from(payload),
            frame_sizes: first.frame_sizes.clone(),
        })
    }
}
