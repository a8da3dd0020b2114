//! Per-peer session state and the handle given to the application layer.

pub mod receive;
pub mod send;
pub mod splits;

use crate::error::{RakError, Result};
use crate::handler::DisconnectReason;
use crate::metrics::ServerMetrics;
use crate::protocol::acknowledge::{Acknowledge, RangeList};
use crate::protocol::connected::encode_disconnect_notification;
use crate::protocol::datagram::{Datagram, Frame};
use crate::protocol::Reliability;
use bytes::{Bytes, BytesMut};
use log::debug;
use receive::{ReceiveWindow, SequenceOutcome};
use send::{RtoSweep, SendWindow};
use splits::SplitAssembler;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created on OpenConnectionRequest2; login not yet complete.
    Connecting,
    /// Login complete; application messages flow.
    Connected,
    /// A disconnect notification is on its way out.
    Disconnecting,
    /// Dead; dropped from the table on the next cleaner pass.
    Evicted,
}

/// Everything the server keeps for one peer.
#[derive(Debug)]
pub struct Session {
    addr: SocketAddr,
    client_guid: u64,
    mtu: u16,
    state: SessionState,
    last_activity: Instant,
    receive: ReceiveWindow,
    send: SendWindow,
    splits: SplitAssembler,
    disconnect_reason: Option<DisconnectReason>,
}

impl Session {
    pub fn new(addr: SocketAddr, client_guid: u64, mtu: u16, now: Instant) -> Self {
        Self {
            addr,
            client_guid,
            mtu,
            state: SessionState::Connecting,
            last_activity: now,
            receive: ReceiveWindow::new(),
            send: SendWindow::new(mtu),
            splits: SplitAssembler::new(),
            disconnect_reason: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.addr
    }

    pub fn client_guid(&self) -> u64 {
        self.client_guid
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_evicted(&self) -> bool {
        self.state == SessionState::Evicted
    }

    pub fn mark_connected(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }
    }

    pub fn begin_disconnect(&mut self) {
        if !self.is_evicted() {
            self.state = SessionState::Disconnecting;
        }
    }

    /// Marks the session dead. The first recorded reason wins.
    pub fn evict(&mut self, reason: DisconnectReason) {
        if !self.is_evicted() {
            self.state = SessionState::Evicted;
            self.disconnect_reason = Some(reason);
        }
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    pub fn note_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    /// Feeds one connected-data datagram through duplicate suppression,
    /// split reassembly, and ordering. Returns the frames to deliver upward,
    /// in order. A duplicate datagram yields no frames but its ACK is still
    /// scheduled.
    pub fn handle_datagram(&mut self, datagram: Datagram, now: Instant) -> Result<Vec<Frame>> {
        match self.receive.accept_sequence(datagram.sequence) {
            SequenceOutcome::Fresh => {}
            SequenceOutcome::Duplicate | SequenceOutcome::OutOfWindow => return Ok(Vec::new()),
        }

        let mut deliverable = Vec::new();
        for frame in datagram.frames {
            let frame = if frame.split.is_some() {
                match self.splits.insert(frame, now)? {
                    Some(completed) => completed,
                    None => continue,
                }
            } else {
                frame
            };
            deliverable.extend(self.receive.accept_frame(frame));
        }
        Ok(deliverable)
    }

    pub fn handle_ack(&mut self, ranges: &RangeList, now: Instant) -> u64 {
        self.send.handle_ack(ranges, now)
    }

    pub fn handle_nak(&mut self, ranges: &RangeList, now: Instant) -> Vec<Bytes> {
        if self.is_evicted() {
            return Vec::new();
        }
        self.send.handle_nak(ranges, now)
    }

    /// Queues an outbound message body.
    pub fn queue_message(
        &mut self,
        body: Bytes,
        reliability: Reliability,
        channel: u8,
    ) -> Result<()> {
        if self.is_evicted() {
            return Err(RakError::SessionEvicted);
        }
        self.send.queue_message(body, reliability, channel)
    }

    /// Drains pending ACKs, NAKs, and queued frames into encoded datagrams
    /// ready for the socket.
    pub fn flush(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        let max_wire = self.mtu as usize - 1;
        if let Some(acks) = self.receive.take_acks() {
            for chunk in acks.into_chunks(max_wire) {
                out.push(Acknowledge::ack(chunk).to_bytes()?);
            }
        }
        if let Some(naks) = self.receive.take_naks() {
            for chunk in naks.into_chunks(max_wire) {
                out.push(Acknowledge::nak(chunk).to_bytes()?);
            }
        }
        out.extend(self.send.flush(now)?);
        Ok(out)
    }

    /// RTO expiry pass plus split-reassembly expiry.
    pub fn sweep(&mut self, now: Instant) -> RtoSweep {
        self.splits.sweep(now);
        self.send.sweep(now)
    }

    pub fn rtt_ms(&self) -> u64 {
        self.send.rtt_ms()
    }

    pub fn rto_ms(&self) -> u64 {
        self.send.rto_ms()
    }

    pub fn unacked_len(&self) -> usize {
        self.send.unacked_len()
    }

    pub fn gave_up_total(&self) -> u64 {
        self.send.gave_up_total()
    }
}

/// Locks a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fire-and-forget transmit. Failures are swallowed; reliable traffic is
/// recovered by the RTO path.
pub(crate) fn transmit(
    socket: &UdpSocket,
    metrics: &ServerMetrics,
    peer: SocketAddr,
    bytes: &[u8],
) {
    match socket.try_send_to(bytes, peer) {
        Ok(sent) => metrics.count_out(sent),
        Err(error) => debug!("send to {peer} failed: {error}"),
    }
}

/// Cheap clone handed to the application layer; sending and disconnecting
/// go through it.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    addr: SocketAddr,
    client_guid: u64,
    session: Arc<Mutex<Session>>,
    socket: Arc<UdpSocket>,
    metrics: Arc<ServerMetrics>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("addr", &self.inner.addr)
            .field("client_guid", &self.inner.client_guid)
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        session: Arc<Mutex<Session>>,
        socket: Arc<UdpSocket>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let (addr, client_guid) = {
            let session = lock(&session);
            (session.peer(), session.client_guid())
        };
        Self {
            inner: Arc::new(HandleInner {
                addr,
                client_guid,
                session,
                socket,
                metrics,
            }),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn client_guid(&self) -> u64 {
        self.inner.client_guid
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.session).state()
    }

    /// Smoothed round-trip time of the peer, in milliseconds.
    pub fn rtt_ms(&self) -> u64 {
        lock(&self.inner.session).rtt_ms()
    }

    /// Queues a raw message body and transmits it immediately.
    pub fn send_payload(&self, body: Bytes, reliability: Reliability, channel: u8) -> Result<()> {
        let buffers = {
            let mut session = lock(&self.inner.session);
            session.queue_message(body, reliability, channel)?;
            session.flush(Instant::now())?
        };
        for bytes in &buffers {
            transmit(&self.inner.socket, &self.inner.metrics, self.inner.addr, bytes);
        }
        Ok(())
    }

    /// Marks the session evicted; the cleaner removes it from the table and
    /// fires `on_disconnect`. With `notify_peer` a disconnect notification
    /// goes out first.
    pub fn disconnect(&self, reason: DisconnectReason, notify_peer: bool) {
        let buffers = {
            let mut session = lock(&self.inner.session);
            if session.is_evicted() {
                return;
            }
            session.begin_disconnect();
            let mut buffers = Vec::new();
            if notify_peer {
                let mut writer = BytesMut::new();
                if encode_disconnect_notification(&mut writer).is_ok()
                    && session
                        .queue_message(writer.freeze(), Reliability::Unreliable, 0)
                        .is_ok()
                {
                    buffers = session.flush(Instant::now()).unwrap_or_default();
                }
            }
            session.evict(reason);
            buffers
        };
        for bytes in &buffers {
            transmit(&self.inner.socket, &self.inner.metrics, self.inner.addr, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::datagram::{DatagramHeader, OrderingInfo, SplitInfo};

    fn session() -> Session {
        Session::new("10.0.0.1:19132".parse().unwrap(), 42, 1400, Instant::now())
    }

    fn data_datagram(sequence: u32, frames: Vec<Frame>) -> Datagram {
        Datagram {
            header: DatagramHeader::data(false),
            sequence,
            frames,
        }
    }

    fn ordered(index: u32, body: &'static [u8]) -> Frame {
        Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(index),
            sequence_index: None,
            ordering: Some(OrderingInfo { index, channel: 0 }),
            split: None,
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn duplicate_datagram_delivers_once_but_acks_twice() {
        let mut session = session();
        let now = Instant::now();
        let datagram = data_datagram(0, vec![ordered(0, b"hello")]);

        let first = session.handle_datagram(datagram.clone(), now).unwrap();
        assert_eq!(first.len(), 1);

        let second = session.handle_datagram(datagram, now).unwrap();
        assert!(second.is_empty());

        let buffers = session.flush(now).unwrap();
        // One ACK datagram acknowledging sequence 0 (coalesced re-ACK).
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0][0], crate::protocol::ACK_HEADER);
    }

    #[test]
    fn reordered_datagrams_deliver_in_order() {
        let mut session = session();
        let now = Instant::now();

        // Ordering indices 0, 1, 2 arrive in datagram order 2, 0, 1.
        let out2 = session
            .handle_datagram(data_datagram(0, vec![ordered(2, b"two")]), now)
            .unwrap();
        assert!(out2.is_empty());
        let out0 = session
            .handle_datagram(data_datagram(1, vec![ordered(0, b"zero")]), now)
            .unwrap();
        assert_eq!(out0.len(), 1);
        let out1 = session
            .handle_datagram(data_datagram(2, vec![ordered(1, b"one")]), now)
            .unwrap();
        assert_eq!(out1.len(), 2);

        let delivered: Vec<&[u8]> = out0
            .iter()
            .chain(out1.iter())
            .map(|frame| &frame.body[..])
            .collect();
        assert_eq!(delivered, vec![&b"zero"[..], b"one", b"two"]);
    }

    #[test]
    fn split_message_across_datagrams_delivers_once() {
        let mut session = session();
        let now = Instant::now();

        let part = |index: u32, body: &'static [u8]| Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(0),
            sequence_index: None,
            ordering: Some(OrderingInfo { index: 0, channel: 0 }),
            split: Some(SplitInfo { count: 3, id: 7, index }),
            body: Bytes::from_static(body),
        };

        // Parts arrive in order 2, 0, 1.
        assert!(session
            .handle_datagram(data_datagram(0, vec![part(2, b"c")]), now)
            .unwrap()
            .is_empty());
        assert!(session
            .handle_datagram(data_datagram(1, vec![part(0, b"a")]), now)
            .unwrap()
            .is_empty());
        let delivered = session
            .handle_datagram(data_datagram(2, vec![part(1, b"b")]), now)
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(&delivered[0].body[..], b"abc");
    }

    #[test]
    fn eviction_is_terminal_and_keeps_first_reason() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Connecting);
        session.mark_connected();
        assert_eq!(session.state(), SessionState::Connected);

        session.evict(DisconnectReason::InactivityTimeout);
        session.evict(DisconnectReason::Requested);
        assert!(session.is_evicted());
        assert_eq!(
            session.disconnect_reason(),
            Some(DisconnectReason::InactivityTimeout)
        );

        assert!(matches!(
            session.queue_message(Bytes::from_static(b"x"), Reliability::Reliable, 0),
            Err(RakError::SessionEvicted)
        ));
    }
}
