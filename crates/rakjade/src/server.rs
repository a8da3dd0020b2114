//! The transport server: socket ownership, datagram classification, the
//! handshake, and the periodic flush/cleanup tasks.

use crate::config::{ServerConfig, RAKNET_PROTOCOL_VERSION};
use crate::error::{RakError, Result};
use crate::handler::{
    AdmissionController, DisconnectReason, MessageCodec, MotdProvider, QueryResponder,
    ServerInfo, SessionEvents,
};
use crate::metrics::ServerMetrics;
use crate::protocol::connected::{
    ConnectedPing, ConnectedPong, ConnectionRequest, ConnectionRequestAccepted,
    NewIncomingConnection,
};
use crate::protocol::datagram::{Datagram, DatagramHeader};
use crate::protocol::offline::{
    IncompatibleProtocolVersion, NoFreeIncomingConnections, OpenConnectionReply1,
    OpenConnectionReply2, OpenConnectionRequest1, OpenConnectionRequest2, UnconnectedPing,
    UnconnectedPong,
};
use crate::protocol::{ids, Frame, RangeList, Reliability};
use crate::session::{lock, transmit, Session, SessionHandle};
use crate::session::SessionState;
use crate::trace::{Direction, PacketTrace};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time;

/// Cadence of the ACK/outgoing-queue flush task.
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);
/// Cadence of the cleaner (eviction, RTO scan, handshake pruning).
const CLEANER_INTERVAL: Duration = Duration::from_secs(1);
/// Duplicate OpenConnectionRequest1s inside this window are suppressed.
const OPEN_IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(3);
/// A session that gave up on this many datagrams is disconnected.
const SESSION_GIVE_UP_LIMIT: u64 = 8;
/// Receive buffer; comfortably above the largest negotiable MTU.
const RECV_BUFFER_LEN: usize = 2048;

struct SessionEntry<M> {
    session: Arc<Mutex<Session>>,
    handle: SessionHandle,
    /// Delivery queue for ordered messages when `force_ordering_for_all`
    /// moves them off the datagram workers.
    ordered_tx: Option<mpsc::UnboundedSender<M>>,
}

impl<M> Clone for SessionEntry<M> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            handle: self.handle.clone(),
            ordered_tx: self.ordered_tx.clone(),
        }
    }
}

struct ServerInner<C, E>
where
    C: MessageCodec,
    E: SessionEvents<Message = C::Message>,
{
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    guid: u64,
    started: Instant,
    codec: Arc<C>,
    events: Arc<E>,
    motd: Arc<dyn MotdProvider>,
    admission: Arc<dyn AdmissionController>,
    query: Option<Arc<dyn QueryResponder>>,
    sessions: DashMap<SocketAddr, SessionEntry<C::Message>>,
    /// Stage-1 handshakes in flight, for duplicate suppression.
    pending_opens: DashMap<SocketAddr, Instant>,
    metrics: Arc<ServerMetrics>,
    packet_trace: PacketTrace,
}

/// Reliable-datagram transport server.
pub struct RakServer<C, E>
where
    C: MessageCodec,
    E: SessionEvents<Message = C::Message>,
{
    inner: Arc<ServerInner<C, E>>,
}

impl<C, E> Clone for RakServer<C, E>
where
    C: MessageCodec,
    E: SessionEvents<Message = C::Message>,
{
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C, E> RakServer<C, E>
where
    C: MessageCodec,
    E: SessionEvents<Message = C::Message>,
{
    /// Binds the UDP socket and assembles the server. Startup failures abort
    /// here; nothing is spawned yet.
    pub async fn bind(
        config: ServerConfig,
        codec: C,
        events: E,
        motd: Arc<dyn MotdProvider>,
        admission: Arc<dyn AdmissionController>,
        query: Option<Arc<dyn QueryResponder>>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr()).await?;
        let guid = config.server_guid.unwrap_or_else(rand::random::<u64>);
        info!("transport bound to {} (guid {})", socket.local_addr()?, guid);

        let packet_trace = PacketTrace::new(&config.trace_packets);
        Ok(Self {
            inner: Arc::new(ServerInner {
                socket: Arc::new(socket),
                config,
                guid,
                started: Instant::now(),
                codec: Arc::new(codec),
                events: Arc::new(events),
                motd,
                admission,
                query,
                sessions: DashMap::new(),
                pending_opens: DashMap::new(),
                metrics: Arc::new(ServerMetrics::default()),
                packet_trace,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn guid(&self) -> u64 {
        self.inner.guid
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.inner.metrics.clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session(&self, peer: SocketAddr) -> Option<SessionHandle> {
        self.inner.sessions.get(&peer).map(|entry| entry.handle.clone())
    }

    /// Encodes and sends an application message on a session.
    pub fn send(
        &self,
        session: &SessionHandle,
        message: &C::Message,
        reliability: Reliability,
        channel: u8,
    ) -> Result<()> {
        let body = self.inner.codec.encode(message);
        session.send_payload(body, reliability, channel)
    }

    pub fn disconnect(&self, session: &SessionHandle, reason: DisconnectReason, notify_peer: bool) {
        session.disconnect(reason, notify_peer);
    }

    /// Runs the receive loop until the socket fails permanently. Datagram
    /// workers and the periodic tasks are spawned onto the runtime.
    pub async fn run(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel::<(Bytes, SocketAddr)>(4096);
        let rx = Arc::new(AsyncMutex::new(rx));
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        for _ in 0..workers {
            let inner = self.inner.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some((data, peer)) => inner.process_datagram(data, peer),
                        None => break,
                    }
                }
            });
        }
        tokio::spawn(self.inner.clone().flush_loop());
        tokio::spawn(self.inner.clone().cleaner_loop());

        info!("receive loop started with {workers} workers");
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            match self.inner.socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    if len == 0 {
                        continue;
                    }
                    self.inner.metrics.count_in(len);
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if tx.send((data, peer)).await.is_err() {
                        return Ok(());
                    }
                }
                // Spurious per-peer errors must not take the loop down.
                Err(error)
                    if matches!(
                        error.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::Interrupted
                    ) =>
                {
                    trace!("transient receive error: {error}");
                }
                Err(error) => {
                    warn!("receive loop ending: {error}");
                    return Err(error.into());
                }
            }
        }
    }
}

impl<C, E> ServerInner<C, E>
where
    C: MessageCodec,
    E: SessionEvents<Message = C::Message>,
{
    /// Milliseconds since the server started; the timestamp base for
    /// connected pings and the login exchange.
    fn time_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    fn send_to(&self, peer: SocketAddr, bytes: &[u8]) {
        self.packet_trace.log(Direction::Out, peer, bytes);
        transmit(&self.socket, &self.metrics, peer, bytes);
    }

    /// Malformed traffic: drop the datagram and blacklist the peer.
    fn punish_malformed(&self, peer: SocketAddr, error: &RakError) {
        warn!("malformed datagram from {peer}: {error}; blacklisting");
        self.admission.blacklist(peer.ip());
    }

    fn process_datagram(&self, data: Bytes, peer: SocketAddr) {
        self.packet_trace.log(Direction::In, peer, &data);
        let first = data[0];

        if first == ids::QUERY_MAGIC {
            if self.config.enable_query {
                if let Some(query) = &self.query {
                    if let Some(reply) = query.respond(peer, &data) {
                        self.send_to(peer, &reply);
                    }
                }
            }
            return;
        }
        if first < ids::OFFLINE_BOUNDARY {
            self.handle_offline(first, data, peer);
            return;
        }
        self.handle_connected(data, peer);
    }

    // --- Offline path -----------------------------------------------------

    fn handle_offline(&self, id: u8, data: Bytes, peer: SocketAddr) {
        if self.admission.is_blacklisted(peer.ip()) {
            return;
        }
        let mut reader = data.slice(1..);
        match id {
            ids::UNCONNECTED_PING => match UnconnectedPing::decode(&mut reader) {
                Ok(ping) => self.handle_unconnected_ping(ping, peer),
                Err(error) => self.punish_malformed(peer, &error),
            },
            ids::OPEN_CONNECTION_REQUEST_1 => match OpenConnectionRequest1::decode(&mut reader) {
                Ok(request) => self.handle_open_request_1(request, data.len(), peer),
                Err(error) => self.punish_malformed(peer, &error),
            },
            ids::OPEN_CONNECTION_REQUEST_2 => match OpenConnectionRequest2::decode(&mut reader) {
                Ok(request) => self.handle_open_request_2(request, peer),
                Err(error) => self.punish_malformed(peer, &error),
            },
            other => {
                trace!("unhandled offline message {other:#04x} from {peer}");
            }
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            guid: self.guid,
            player_count: self.sessions.len(),
            max_players: self.config.max_players,
            port: self.config.port,
        }
    }

    fn handle_unconnected_ping(&self, ping: UnconnectedPing, peer: SocketAddr) {
        let info = self.server_info();
        let mut pongs = vec![self.motd.motd(&info, peer, false)];
        if self.config.enable_edu {
            pongs.push(self.motd.motd(&info, peer, true));
        }
        for motd in pongs {
            let pong = UnconnectedPong {
                time: ping.time,
                server_guid: self.guid,
                motd,
            };
            let mut writer = BytesMut::new();
            if pong.encode(&mut writer).is_ok() {
                self.send_to(peer, &writer);
            }
        }
    }

    fn handle_open_request_1(
        &self,
        request: OpenConnectionRequest1,
        wire_len: usize,
        peer: SocketAddr,
    ) {
        if !self.admission.accept_connection(peer) {
            self.deny_connection(peer);
            return;
        }
        if request.protocol_version != RAKNET_PROTOCOL_VERSION {
            debug!(
                "peer {} speaks raknet protocol {}, want {}",
                peer, request.protocol_version, RAKNET_PROTOCOL_VERSION
            );
            let reply = IncompatibleProtocolVersion {
                server_protocol: RAKNET_PROTOCOL_VERSION,
                server_guid: self.guid,
            };
            let mut writer = BytesMut::new();
            if reply.encode(&mut writer).is_ok() {
                self.send_to(peer, &writer);
            }
            return;
        }

        let now = Instant::now();
        if let Some(seen) = self.pending_opens.get(&peer) {
            if now.duration_since(*seen) < OPEN_IDEMPOTENCY_WINDOW {
                trace!("suppressing duplicate open-connection request from {peer}");
                return;
            }
        }
        if self.pending_opens.len() >= self.config.max_concurrent_connects {
            self.deny_connection(peer);
            return;
        }
        self.pending_opens.insert(peer, now);

        // The request is padded to probe the path; the usable MTU is the
        // padded size plus IP and UDP headers.
        let ip_overhead = if peer.is_ipv4() { 20 } else { 40 };
        let proposed = (wire_len + ip_overhead + 8).min(u16::MAX as usize) as u16;
        let mtu = self.config.clamp_mtu(proposed);

        let reply = OpenConnectionReply1 {
            server_guid: self.guid,
            server_has_security: false,
            mtu,
        };
        let mut writer = BytesMut::new();
        if reply.encode(&mut writer).is_ok() {
            self.send_to(peer, &writer);
        }
    }

    fn handle_open_request_2(&self, request: OpenConnectionRequest2, peer: SocketAddr) {
        self.pending_opens.remove(&peer);

        if let Some(existing) = self.sessions.get(&peer).map(|entry| entry.value().clone()) {
            let state = lock(&existing.session).state();
            if state == SessionState::Connecting {
                trace!("duplicate open-connection request 2 from {peer}");
                return;
            }
            // A later-state session is stale; replace it.
            debug!("replacing session for {peer} (was {state:?})");
            if let Some((_, old)) = self.sessions.remove(&peer) {
                lock(&old.session).evict(DisconnectReason::Replaced);
                self.metrics.sessions.fetch_sub(1, Ordering::Relaxed);
                self.events
                    .on_disconnect(&old.handle, DisconnectReason::Replaced);
            }
        }

        if self.sessions.len() >= self.config.max_players {
            self.deny_connection(peer);
            return;
        }

        let mtu = self.config.clamp_mtu(request.mtu);
        let session = Arc::new(Mutex::new(Session::new(
            peer,
            request.client_guid,
            mtu,
            Instant::now(),
        )));
        let handle = SessionHandle::new(session.clone(), self.socket.clone(), self.metrics.clone());

        let ordered_tx = if self.config.force_ordering_for_all {
            let (tx, mut rx) = mpsc::unbounded_channel::<C::Message>();
            let events = self.events.clone();
            let delivery_handle = handle.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    events.on_message(&delivery_handle, message);
                }
            });
            Some(tx)
        } else {
            None
        };

        let entry = SessionEntry { session, handle, ordered_tx };
        match self.sessions.entry(peer) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Another worker won the race; treat ours as the duplicate.
                trace!("lost session-creation race for {peer}");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        self.metrics.sessions.fetch_add(1, Ordering::Relaxed);
        debug!(
            "session created for {peer} (guid {}, mtu {mtu})",
            request.client_guid
        );

        let reply = OpenConnectionReply2 {
            server_guid: self.guid,
            client_address: peer,
            mtu,
            server_has_security: false,
        };
        let mut writer = BytesMut::new();
        if reply.encode(&mut writer).is_ok() {
            self.send_to(peer, &writer);
        }
    }

    fn deny_connection(&self, peer: SocketAddr) {
        self.metrics
            .denied_connection_requests
            .fetch_add(1, Ordering::Relaxed);
        let reply = NoFreeIncomingConnections { server_guid: self.guid };
        let mut writer = BytesMut::new();
        if reply.encode(&mut writer).is_ok() {
            self.send_to(peer, &writer);
        }
    }

    // --- Connected path ---------------------------------------------------

    fn handle_connected(&self, data: Bytes, peer: SocketAddr) {
        let Some(entry) = self.sessions.get(&peer).map(|entry| entry.value().clone()) else {
            trace!("datagram from unknown peer {peer}, dropping");
            return;
        };

        let header = DatagramHeader::from_byte(data[0]);
        let now = Instant::now();

        if header.is_ack || header.is_nak {
            let mut reader = data.slice(1..);
            let ranges = match RangeList::decode(&mut reader) {
                Ok(ranges) => ranges,
                Err(error) => {
                    self.punish_malformed(peer, &error);
                    return;
                }
            };
            let resend = {
                let mut session = lock(&entry.session);
                if session.is_evicted() {
                    return;
                }
                session.note_activity(now);
                if header.is_ack {
                    self.metrics.acks_in.fetch_add(1, Ordering::Relaxed);
                    session.handle_ack(&ranges, now);
                    Vec::new()
                } else {
                    self.metrics.naks_in.fetch_add(1, Ordering::Relaxed);
                    session.handle_nak(&ranges, now)
                }
            };
            if !resend.is_empty() {
                self.metrics
                    .resends
                    .fetch_add(resend.len() as u64, Ordering::Relaxed);
                for bytes in &resend {
                    self.send_to(peer, bytes);
                }
            }
            return;
        }

        let mut reader = data.clone();
        let datagram = match Datagram::decode(&mut reader) {
            Ok(datagram) => datagram,
            Err(error) => {
                self.punish_malformed(peer, &error);
                return;
            }
        };

        let deliverable = {
            let mut session = lock(&entry.session);
            if session.is_evicted() {
                return;
            }
            session.note_activity(now);
            match session.handle_datagram(datagram, now) {
                Ok(frames) => frames,
                Err(error) => {
                    // Broken reassembly state is unrecoverable for the peer.
                    warn!("split reassembly failed for {peer}: {error}");
                    session.evict(DisconnectReason::SplitReassemblyError);
                    return;
                }
            }
        };

        for frame in deliverable {
            self.route_frame(&entry, frame, peer);
        }
    }

    /// Dispatches one complete, in-order frame: session control messages are
    /// handled here, everything else goes through the codec to the
    /// application layer.
    fn route_frame(&self, entry: &SessionEntry<C::Message>, frame: Frame, peer: SocketAddr) {
        let Some(&id) = frame.body.first() else {
            return;
        };
        let mut body = frame.body.slice(1..);
        match id {
            ids::CONNECTED_PING => {
                let Ok(ping) = ConnectedPing::decode(&mut body) else {
                    debug!("bad connected ping from {peer}");
                    return;
                };
                let pong = ConnectedPong {
                    ping_time: ping.time,
                    pong_time: self.time_ms(),
                };
                let mut writer = BytesMut::new();
                if pong.encode(&mut writer).is_ok() {
                    if let Err(error) =
                        entry
                            .handle
                            .send_payload(writer.freeze(), Reliability::Unreliable, 0)
                    {
                        debug!("pong to {peer} failed: {error}");
                    }
                }
            }
            ids::CONNECTED_PONG => {}
            ids::CONNECTION_REQUEST => {
                let Ok(request) = ConnectionRequest::decode(&mut body) else {
                    debug!("bad connection request from {peer}");
                    return;
                };
                let accepted =
                    ConnectionRequestAccepted::new(peer, request.time, self.time_ms());
                let mut writer = BytesMut::new();
                if accepted.encode(&mut writer).is_ok() {
                    if let Err(error) = entry.handle.send_payload(
                        writer.freeze(),
                        Reliability::ReliableOrdered,
                        0,
                    ) {
                        debug!("connection accept to {peer} failed: {error}");
                    }
                }
            }
            ids::NEW_INCOMING_CONNECTION => {
                // Field layout varies between clients; decode leniently.
                let _ = NewIncomingConnection::decode(&mut body);
                let was_connecting = {
                    let mut session = lock(&entry.session);
                    let was = session.state() == SessionState::Connecting;
                    session.mark_connected();
                    was
                };
                if was_connecting {
                    debug!("login complete for {peer}");
                    self.events.on_connect(&entry.handle);
                }
            }
            ids::DISCONNECT_NOTIFICATION => {
                debug!("peer {peer} disconnected");
                lock(&entry.session).evict(DisconnectReason::PeerDisconnected);
            }
            other => match self.codec.decode(other, body) {
                Some(message) => {
                    if frame.reliability.is_ordered() {
                        if let Some(tx) = &entry.ordered_tx {
                            let _ = tx.send(message);
                            return;
                        }
                    }
                    self.events.on_message(&entry.handle, message);
                }
                None => {
                    debug!("unknown message id {other:#04x} from {peer}, dropping");
                }
            },
        }
    }

    // --- Periodic tasks ---------------------------------------------------

    /// Drains pending ACKs/NAKs and queued frames for every session.
    async fn flush_loop(self: Arc<Self>) {
        let mut interval = time::interval(FLUSH_INTERVAL);
        loop {
            interval.tick().await;
            let entries: Vec<SessionEntry<C::Message>> = self
                .sessions
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            let now = Instant::now();
            for entry in entries {
                let buffers = {
                    let mut session = lock(&entry.session);
                    if session.is_evicted() {
                        Vec::new()
                    } else {
                        session.flush(now).unwrap_or_default()
                    }
                };
                for bytes in &buffers {
                    self.send_to(entry.handle.peer(), bytes);
                }
            }
        }
    }

    /// Evicts idle sessions, runs the RTO scan, removes evicted sessions
    /// from the table, and prunes stale handshakes.
    async fn cleaner_loop(self: Arc<Self>) {
        let mut interval = time::interval(CLEANER_INTERVAL);
        loop {
            interval.tick().await;
            let now = Instant::now();

            self.pending_opens
                .retain(|_, seen| now.duration_since(*seen) < OPEN_IDEMPOTENCY_WINDOW);

            let entries: Vec<SessionEntry<C::Message>> = self
                .sessions
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            for entry in entries {
                let resend = {
                    let mut session = lock(&entry.session);
                    if session.is_evicted() {
                        Vec::new()
                    } else if session.idle_for(now) > self.config.inactivity_timeout {
                        debug!(
                            "evicting idle session {} (idle {:?})",
                            session.peer(),
                            session.idle_for(now)
                        );
                        session.evict(DisconnectReason::InactivityTimeout);
                        Vec::new()
                    } else {
                        let sweep = session.sweep(now);
                        if sweep.gave_up > 0 {
                            self.metrics
                                .failed_resends
                                .fetch_add(sweep.gave_up, Ordering::Relaxed);
                        }
                        if session.gave_up_total() >= SESSION_GIVE_UP_LIMIT {
                            warn!(
                                "session {} lost {} datagrams past the cap, disconnecting",
                                session.peer(),
                                session.gave_up_total()
                            );
                            session.evict(DisconnectReason::ResendCapExceeded);
                        }
                        if !sweep.resend.is_empty() {
                            self.metrics
                                .resends
                                .fetch_add(sweep.resend.len() as u64, Ordering::Relaxed);
                        }
                        sweep.resend
                    }
                };
                for bytes in &resend {
                    self.send_to(entry.handle.peer(), bytes);
                }
            }

            let mut removed: Vec<(SessionHandle, DisconnectReason)> = Vec::new();
            self.sessions.retain(|_, entry| {
                let session = lock(&entry.session);
                if session.is_evicted() {
                    removed.push((
                        entry.handle.clone(),
                        session
                            .disconnect_reason()
                            .unwrap_or(DisconnectReason::Requested),
                    ));
                    false
                } else {
                    true
                }
            });
            for (handle, reason) in removed {
                self.metrics.sessions.fetch_sub(1, Ordering::Relaxed);
                self.events.on_disconnect(&handle, reason);
            }
        }
    }
}
