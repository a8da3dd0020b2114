//! Incoming reliability state: datagram-level duplicate suppression, ACK and
//! NAK scheduling, and per-channel ordered delivery.

use crate::protocol::acknowledge::RangeList;
use crate::protocol::datagram::{Frame, NUM_ORDERING_CHANNELS};
use crate::seq;
use log::warn;
use std::collections::{HashMap, HashSet};

/// Datagrams further than this ahead of the contiguous edge are dropped.
pub const MAX_RECEIVE_WINDOW: u32 = 2048;
/// Ordered frames buffered per channel while waiting for a gap to fill.
const MAX_ORDERING_BACKLOG: usize = 512;

/// What [`ReceiveWindow::accept_sequence`] decided about a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// First sight; the payload must be processed.
    Fresh,
    /// Already seen; the ACK is re-scheduled but the payload is dropped.
    Duplicate,
    /// Too far ahead of the window; dropped without an ACK.
    OutOfWindow,
}

#[derive(Debug, Default)]
struct OrderingChannel {
    expected_index: u32,
    backlog: HashMap<u32, Frame>,
    /// Most recent sequencing index delivered on this channel.
    latest_sequenced: Option<u32>,
}

/// Per-session incoming reliability state.
#[derive(Debug)]
pub struct ReceiveWindow {
    /// Lowest sequence number not yet received; everything before it has
    /// been seen and acknowledged.
    next_expected: u32,
    /// Sequence numbers at or ahead of `next_expected` already received.
    received: HashSet<u32>,
    pending_acks: Vec<u32>,
    pending_naks: HashSet<u32>,
    channels: Vec<OrderingChannel>,
}

impl Default for ReceiveWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveWindow {
    pub fn new() -> Self {
        let mut channels = Vec::with_capacity(NUM_ORDERING_CHANNELS as usize);
        channels.resize_with(NUM_ORDERING_CHANNELS as usize, OrderingChannel::default);
        Self {
            next_expected: 0,
            received: HashSet::new(),
            pending_acks: Vec::new(),
            pending_naks: HashSet::new(),
            channels,
        }
    }

    /// Classifies a datagram sequence number, schedules its ACK, and tracks
    /// any gap it opens for NAK generation.
    pub fn accept_sequence(&mut self, sequence: u32) -> SequenceOutcome {
        if seq::before(sequence, self.next_expected) || self.received.contains(&sequence) {
            // Our ACK may have been lost; acknowledge again but do not
            // re-process the payload.
            self.pending_acks.push(sequence);
            return SequenceOutcome::Duplicate;
        }
        if seq::distance(self.next_expected, sequence) > MAX_RECEIVE_WINDOW {
            return SequenceOutcome::OutOfWindow;
        }

        self.received.insert(sequence);
        self.pending_acks.push(sequence);
        self.pending_naks.remove(&sequence);

        // Everything between the contiguous edge and this datagram is now
        // known missing.
        let mut missing = self.next_expected;
        while missing != sequence {
            if !self.received.contains(&missing) {
                self.pending_naks.insert(missing);
            }
            missing = seq::next(missing);
        }

        // Advance the contiguous edge.
        while self.received.remove(&self.next_expected) {
            self.pending_naks.remove(&self.next_expected);
            self.next_expected = seq::next(self.next_expected);
        }

        SequenceOutcome::Fresh
    }

    /// Drains scheduled ACKs into a coalesced range list.
    pub fn take_acks(&mut self) -> Option<RangeList> {
        if self.pending_acks.is_empty() {
            return None;
        }
        self.pending_acks.sort_unstable();
        self.pending_acks.dedup();
        let list = RangeList::from_sorted(&self.pending_acks);
        self.pending_acks.clear();
        Some(list)
    }

    /// Drains tracked gaps into a NAK range list.
    pub fn take_naks(&mut self) -> Option<RangeList> {
        if self.pending_naks.is_empty() {
            return None;
        }
        let mut missing: Vec<u32> = self.pending_naks.drain().collect();
        missing.sort_unstable();
        Some(RangeList::from_sorted(&missing))
    }

    /// Runs a frame through the ordering machinery. Returns the frames now
    /// deliverable to the application layer, in delivery order.
    pub fn accept_frame(&mut self, frame: Frame) -> Vec<Frame> {
        if frame.reliability.is_sequenced() {
            return self.accept_sequenced(frame);
        }
        if !frame.reliability.is_ordered() {
            return vec![frame];
        }

        let Some(ordering) = frame.ordering else {
            warn!("ordered frame without ordering info, dropping");
            return Vec::new();
        };
        let channel = &mut self.channels[ordering.channel as usize];

        if seq::before(ordering.index, channel.expected_index) {
            // Re-delivered ordered frame; already passed upward.
            return Vec::new();
        }
        if ordering.index != channel.expected_index {
            if channel.backlog.len() >= MAX_ORDERING_BACKLOG {
                warn!(
                    "ordering backlog full on channel {}, dropping frame {}",
                    ordering.channel, ordering.index
                );
                return Vec::new();
            }
            channel.backlog.insert(ordering.index, frame);
            return Vec::new();
        }

        let mut ready = vec![frame];
        channel.expected_index = seq::next(channel.expected_index);
        while let Some(next) = channel.backlog.remove(&channel.expected_index) {
            ready.push(next);
            channel.expected_index = seq::next(channel.expected_index);
        }
        ready
    }

    fn accept_sequenced(&mut self, frame: Frame) -> Vec<Frame> {
        let Some(index) = frame.sequence_index else {
            warn!("sequenced frame without sequence index, dropping");
            return Vec::new();
        };
        let channel_index = frame.ordering.map_or(0, |ordering| ordering.channel);
        let channel = &mut self.channels[channel_index as usize];
        match channel.latest_sequenced {
            Some(latest) if !seq::before(latest, index) => Vec::new(),
            _ => {
                channel.latest_sequenced = Some(index);
                vec![frame]
            }
        }
    }

    #[cfg(test)]
    fn expected_index(&self, channel: u8) -> u32 {
        self.channels[channel as usize].expected_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::datagram::OrderingInfo;
    use crate::protocol::Reliability;
    use bytes::Bytes;

    fn ordered(index: u32, channel: u8, body: &'static [u8]) -> Frame {
        Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(index),
            sequence_index: None,
            ordering: Some(OrderingInfo { index, channel }),
            split: None,
            body: Bytes::from_static(body),
        }
    }

    fn sequenced(index: u32) -> Frame {
        Frame {
            reliability: Reliability::UnreliableSequenced,
            reliable_index: None,
            sequence_index: Some(index),
            ordering: Some(OrderingInfo { index, channel: 0 }),
            split: None,
            body: Bytes::new(),
        }
    }

    #[test]
    fn fresh_then_duplicate() {
        let mut window = ReceiveWindow::new();
        assert_eq!(window.accept_sequence(0), SequenceOutcome::Fresh);
        assert_eq!(window.accept_sequence(0), SequenceOutcome::Duplicate);

        // Both sightings are acknowledged.
        let acks = window.take_acks().unwrap();
        assert_eq!(acks.ranges(), &[(0, 0)]);
    }

    #[test]
    fn acks_coalesce() {
        let mut window = ReceiveWindow::new();
        for sequence in [0, 1, 2, 5, 7] {
            assert_eq!(window.accept_sequence(sequence), SequenceOutcome::Fresh);
        }
        let acks = window.take_acks().unwrap();
        assert_eq!(acks.ranges(), &[(0, 2), (5, 5), (7, 7)]);
        assert!(window.take_acks().is_none());
    }

    #[test]
    fn gaps_become_naks_until_filled() {
        let mut window = ReceiveWindow::new();
        window.accept_sequence(0);
        window.accept_sequence(3);

        let naks = window.take_naks().unwrap();
        assert_eq!(naks.ranges(), &[(1, 2)]);

        // The retransmissions arrive; no NAKs remain.
        window.accept_sequence(1);
        window.accept_sequence(2);
        assert!(window.take_naks().is_none());
    }

    #[test]
    fn window_advances_across_wrap() {
        let mut window = ReceiveWindow::new();
        window.next_expected = 0x00FF_FFFE;

        assert_eq!(window.accept_sequence(0x00FF_FFFE), SequenceOutcome::Fresh);
        assert_eq!(window.accept_sequence(0x00FF_FFFF), SequenceOutcome::Fresh);
        assert_eq!(window.accept_sequence(0), SequenceOutcome::Fresh);
        assert_eq!(window.next_expected, 1);

        // A pre-wrap sequence is now a duplicate, not a future datagram.
        assert_eq!(window.accept_sequence(0x00FF_FFFE), SequenceOutcome::Duplicate);
    }

    #[test]
    fn far_future_sequence_is_dropped() {
        let mut window = ReceiveWindow::new();
        assert_eq!(
            window.accept_sequence(MAX_RECEIVE_WINDOW + 1),
            SequenceOutcome::OutOfWindow
        );
        assert!(window.take_acks().is_none());
    }

    #[test]
    fn ordered_frames_deliver_in_index_order() {
        let mut window = ReceiveWindow::new();

        assert!(window.accept_frame(ordered(2, 0, b"two")).is_empty());
        let first = window.accept_frame(ordered(0, 0, b"zero"));
        assert_eq!(first.len(), 1);
        assert_eq!(&first[0].body[..], b"zero");

        let rest = window.accept_frame(ordered(1, 0, b"one"));
        assert_eq!(rest.len(), 2);
        assert_eq!(&rest[0].body[..], b"one");
        assert_eq!(&rest[1].body[..], b"two");
        assert_eq!(window.expected_index(0), 3);
    }

    #[test]
    fn stale_ordered_frame_is_not_redelivered() {
        let mut window = ReceiveWindow::new();
        window.accept_frame(ordered(0, 0, b"zero"));
        assert!(window.accept_frame(ordered(0, 0, b"zero")).is_empty());
    }

    #[test]
    fn channels_are_independent() {
        let mut window = ReceiveWindow::new();
        assert!(window.accept_frame(ordered(1, 0, b"a")).is_empty());
        // Channel 1 is not blocked by channel 0's gap.
        assert_eq!(window.accept_frame(ordered(0, 1, b"b")).len(), 1);
    }

    #[test]
    fn unordered_frames_pass_through() {
        let mut window = ReceiveWindow::new();
        let frame = Frame::unreliable(Bytes::from_static(b"now"));
        assert_eq!(window.accept_frame(frame).len(), 1);
    }

    #[test]
    fn sequenced_keeps_newest_only() {
        let mut window = ReceiveWindow::new();
        assert_eq!(window.accept_frame(sequenced(1)).len(), 1);
        assert!(window.accept_frame(sequenced(0)).is_empty());
        assert!(window.accept_frame(sequenced(1)).is_empty());
        assert_eq!(window.accept_frame(sequenced(5)).len(), 1);
    }
}
