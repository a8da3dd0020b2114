//! Outgoing reliability state: fragmentation to the negotiated MTU, datagram
//! retention for retransmission, and the RTT/RTO estimators.

use crate::error::{RakError, Result};
use crate::protocol::acknowledge::RangeList;
use crate::protocol::datagram::{
    Datagram, Frame, OrderingInfo, SplitInfo, DATAGRAM_HEADER_LEN, NUM_ORDERING_CHANNELS,
};
use crate::protocol::Reliability;
use crate::seq;
use crate::session::splits::MAX_SPLIT_PARTS;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// A datagram is given up on once it has been transmitted this many times.
pub const RETRANSMISSION_CAP: u32 = 10;
/// RTO before the first RTT sample arrives, in milliseconds.
const INITIAL_RTO_MS: u64 = 500;
/// Constant term of the RTO formula, in milliseconds.
const RTO_BASE_MS: u64 = 100;

/// A transmitted datagram retained until acknowledged or given up on.
#[derive(Debug, Clone)]
pub struct RetainedDatagram {
    pub bytes: Bytes,
    pub sent_at: Instant,
    pub transmissions: u32,
}

/// Result of an RTO sweep over the retained datagrams.
#[derive(Debug, Default)]
pub struct RtoSweep {
    /// Encoded datagrams to put back on the wire.
    pub resend: Vec<Bytes>,
    /// Datagrams dropped after exceeding the retransmission cap.
    pub gave_up: u64,
}

fn frame_overhead(reliability: Reliability, split: bool) -> usize {
    let mut len = 1 + 2;
    if reliability.is_reliable() {
        len += 3;
    }
    if reliability.is_sequenced() {
        len += 3;
    }
    if reliability.carries_ordering() {
        len += 3 + 1;
    }
    if split {
        len += 4 + 2 + 4;
    }
    len
}

/// Per-session outgoing reliability state.
#[derive(Debug)]
pub struct SendWindow {
    mtu: usize,
    next_sequence: u32,
    next_reliable_index: u32,
    next_ordering_index: [u32; NUM_ORDERING_CHANNELS as usize],
    next_sequencing_index: [u32; NUM_ORDERING_CHANNELS as usize],
    next_split_id: u16,
    queue: VecDeque<Frame>,
    unacked: HashMap<u32, RetainedDatagram>,
    rtt_ms: u64,
    rtt_var_ms: u64,
    rto_ms: u64,
    has_rtt_sample: bool,
    consecutive_resends: u32,
    gave_up_total: u64,
}

impl SendWindow {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu: mtu as usize,
            next_sequence: 0,
            next_reliable_index: 0,
            next_ordering_index: [0; NUM_ORDERING_CHANNELS as usize],
            next_sequencing_index: [0; NUM_ORDERING_CHANNELS as usize],
            next_split_id: 0,
            queue: VecDeque::new(),
            unacked: HashMap::new(),
            rtt_ms: 0,
            rtt_var_ms: 0,
            rto_ms: INITIAL_RTO_MS,
            has_rtt_sample: false,
            consecutive_resends: 0,
            gave_up_total: 0,
        }
    }

    /// Queues one application message, fragmenting it when it does not fit a
    /// single datagram. Fragmented messages are promoted to a reliable class
    /// so every part can be recovered.
    pub fn queue_message(
        &mut self,
        body: Bytes,
        reliability: Reliability,
        channel: u8,
    ) -> Result<()> {
        let channel = channel % NUM_ORDERING_CHANNELS;
        let single_max = self.mtu - DATAGRAM_HEADER_LEN - frame_overhead(reliability, false);

        if body.len() <= single_max {
            let frame = self.build_frame(body, reliability, channel, None);
            self.queue.push_back(frame);
            return Ok(());
        }

        let reliability = if reliability.is_reliable() {
            reliability
        } else if reliability.carries_ordering() {
            Reliability::ReliableOrdered
        } else {
            Reliability::Reliable
        };

        let part_max = self.mtu - DATAGRAM_HEADER_LEN - frame_overhead(reliability, true);
        let count = body.len().div_ceil(part_max);
        if count > MAX_SPLIT_PARTS as usize {
            return Err(RakError::FrameTooLarge(body.len()));
        }

        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);

        // All parts share the message's reliable number and ordering index.
        let reliable_index = self.take_reliable_index();
        let ordering = self.take_ordering(reliability, channel);

        for index in 0..count {
            let start = index * part_max;
            let end = (start + part_max).min(body.len());
            self.queue.push_back(Frame {
                reliability,
                reliable_index: Some(reliable_index),
                sequence_index: None,
                ordering,
                split: Some(SplitInfo {
                    count: count as u32,
                    id: split_id,
                    index: index as u32,
                }),
                body: body.slice(start..end),
            });
        }
        Ok(())
    }

    fn build_frame(
        &mut self,
        body: Bytes,
        reliability: Reliability,
        channel: u8,
        split: Option<SplitInfo>,
    ) -> Frame {
        let reliable_index = reliability.is_reliable().then(|| self.take_reliable_index());
        let sequence_index = reliability.is_sequenced().then(|| {
            let index = self.next_sequencing_index[channel as usize];
            self.next_sequencing_index[channel as usize] = seq::next(index);
            index
        });
        let ordering = self.take_ordering(reliability, channel);
        Frame {
            reliability,
            reliable_index,
            sequence_index,
            ordering,
            split,
            body,
        }
    }

    fn take_reliable_index(&mut self) -> u32 {
        let index = self.next_reliable_index;
        self.next_reliable_index = seq::next(index);
        index
    }

    fn take_ordering(&mut self, reliability: Reliability, channel: u8) -> Option<OrderingInfo> {
        if !reliability.carries_ordering() {
            return None;
        }
        let index = self.next_ordering_index[channel as usize];
        if reliability.is_ordered() {
            self.next_ordering_index[channel as usize] = seq::next(index);
        }
        Some(OrderingInfo { index, channel })
    }

    /// Packs queued frames into datagrams, retains each for retransmission,
    /// and returns the encoded bytes to transmit.
    pub fn flush(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        while !self.queue.is_empty() {
            let mut datagram = Datagram::new(self.next_sequence);
            let mut used = DATAGRAM_HEADER_LEN;
            while let Some(frame) = self.queue.front() {
                let frame_len = frame.wire_len();
                if !datagram.frames.is_empty() && used + frame_len > self.mtu {
                    break;
                }
                used += frame_len;
                if let Some(frame) = self.queue.pop_front() {
                    datagram.frames.push(frame);
                }
            }

            datagram.header.has_split = datagram.frames.iter().any(|frame| frame.split.is_some());
            let bytes = datagram.to_bytes()?;
            self.unacked.insert(
                datagram.sequence,
                RetainedDatagram {
                    bytes: bytes.clone(),
                    sent_at: now,
                    transmissions: 1,
                },
            );
            self.next_sequence = seq::next(self.next_sequence);
            out.push(bytes);
        }
        Ok(out)
    }

    /// Releases every acknowledged datagram and feeds the RTT estimators.
    /// Returns how many retained datagrams the ACK released.
    pub fn handle_ack(&mut self, ranges: &RangeList, now: Instant) -> u64 {
        let mut released = 0;
        for sequence in ranges.iter() {
            if let Some(retained) = self.unacked.remove(&sequence) {
                let sample = now.duration_since(retained.sent_at).as_millis() as u64;
                self.update_rtt(sample);
                released += 1;
            }
        }
        if released > 0 {
            self.consecutive_resends = 0;
        }
        released
    }

    /// Immediately retransmits every NAKed datagram still retained, feeding
    /// the estimators from the original send time. Returns the bytes to put
    /// back on the wire.
    pub fn handle_nak(&mut self, ranges: &RangeList, now: Instant) -> Vec<Bytes> {
        let mut resend = Vec::new();
        for sequence in ranges.iter() {
            if let Some(retained) = self.unacked.get_mut(&sequence) {
                let sample = now.duration_since(retained.sent_at).as_millis() as u64;
                retained.transmissions += 1;
                retained.sent_at = now;
                resend.push(retained.bytes.clone());
                self.consecutive_resends += 1;
                self.update_rtt(sample);
            }
        }
        resend
    }

    /// Retransmits datagrams whose RTO expired and gives up on those past
    /// the retransmission cap.
    pub fn sweep(&mut self, now: Instant) -> RtoSweep {
        let rto = self.rto_ms;
        let mut outcome = RtoSweep::default();
        let mut expired: Vec<u32> = Vec::new();
        for (&sequence, retained) in &self.unacked {
            if now.duration_since(retained.sent_at).as_millis() as u64 > rto {
                expired.push(sequence);
            }
        }
        for sequence in expired {
            let Some(retained) = self.unacked.get_mut(&sequence) else {
                continue;
            };
            if retained.transmissions >= RETRANSMISSION_CAP {
                self.unacked.remove(&sequence);
                outcome.gave_up += 1;
                self.gave_up_total += 1;
            } else {
                retained.transmissions += 1;
                retained.sent_at = now;
                outcome.resend.push(retained.bytes.clone());
                self.consecutive_resends += 1;
            }
        }
        outcome
    }

    fn update_rtt(&mut self, sample_ms: u64) {
        if !self.has_rtt_sample {
            self.rtt_ms = sample_ms;
            self.rtt_var_ms = sample_ms / 2;
            self.has_rtt_sample = true;
        } else {
            self.rtt_ms = (7 * self.rtt_ms + sample_ms) / 8;
            self.rtt_var_ms = (7 * self.rtt_var_ms + self.rtt_ms.abs_diff(sample_ms)) / 8;
        }
        self.rto_ms = self.rtt_ms + 4 * self.rtt_var_ms + RTO_BASE_MS;
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms
    }

    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Total datagrams this session has given up on.
    pub fn gave_up_total(&self) -> u64 {
        self.gave_up_total
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    #[cfg(test)]
    fn retained(&self, sequence: u32) -> Option<&RetainedDatagram> {
        self.unacked.get(&sequence)
    }
}
