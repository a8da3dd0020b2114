//! Interfaces between the transport core and its collaborators: the
//! application layer above, and the MOTD / admission / query providers below.

use crate::session::SessionHandle;
use bytes::Bytes;
use dashmap::DashSet;
use std::net::{IpAddr, SocketAddr};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a disconnect notification.
    PeerDisconnected,
    /// No datagram arrived within the inactivity timeout.
    InactivityTimeout,
    /// Too many retained datagrams exceeded the retransmission cap.
    ResendCapExceeded,
    /// Split reassembly failed for this peer.
    SplitReassemblyError,
    /// A new handshake from the same peer replaced the session.
    Replaced,
    /// The application layer asked for the disconnect.
    Requested,
    /// The server is shutting down.
    ServerClosed,
}

/// Translates between application messages and their wire bodies.
///
/// The id passed to [`decode`](MessageCodec::decode) is the first body byte
/// of the frame; the body excludes it.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Send + 'static;

    fn decode(&self, id: u8, body: Bytes) -> Option<Self::Message>;
    fn encode(&self, message: &Self::Message) -> Bytes;
}

/// Application-layer callbacks. Ordered messages on one channel arrive in
/// strict ordering-index order; nothing is guaranteed across channels or
/// across sessions.
pub trait SessionEvents: Send + Sync + 'static {
    type Message: Send + 'static;

    /// The session completed its login exchange.
    fn on_connect(&self, session: &SessionHandle);
    fn on_message(&self, session: &SessionHandle, message: Self::Message);
    fn on_disconnect(&self, session: &SessionHandle, reason: DisconnectReason);
}

/// Server identity passed to the MOTD provider.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub guid: u64,
    pub player_count: usize,
    pub max_players: usize,
    pub port: u16,
}

/// Produces the advertisement string for unconnected pongs.
pub trait MotdProvider: Send + Sync + 'static {
    fn motd(&self, info: &ServerInfo, peer: SocketAddr, edu: bool) -> String;
}

/// Admission policy consulted before any handshake work is done.
pub trait AdmissionController: Send + Sync + 'static {
    fn is_blacklisted(&self, ip: IpAddr) -> bool;
    fn is_whitelisted(&self, ip: IpAddr) -> bool;
    fn is_greylisted(&self, ip: IpAddr) -> bool;
    /// Gate applied at handshake stage 1; a rejection is answered with
    /// `NoFreeIncomingConnections`.
    fn accept_connection(&self, peer: SocketAddr) -> bool;
    fn blacklist(&self, ip: IpAddr);
}

/// Answers query protocol (0xFE) datagrams.
pub trait QueryResponder: Send + Sync + 'static {
    fn respond(&self, peer: SocketAddr, payload: &[u8]) -> Option<Bytes>;
}

/// In-memory admission lists. Whitelisted addresses bypass the greylist;
/// blacklisted addresses are rejected outright.
#[derive(Debug, Default)]
pub struct AdmissionLists {
    blacklist: DashSet<IpAddr>,
    greylist: DashSet<IpAddr>,
    whitelist: DashSet<IpAddr>,
}

impl AdmissionLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn greylist(&self, ip: IpAddr) {
        self.greylist.insert(ip);
    }

    pub fn whitelist(&self, ip: IpAddr) {
        self.whitelist.insert(ip);
    }
}

impl AdmissionController for AdmissionLists {
    fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.blacklist.contains(&ip)
    }

    fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.whitelist.contains(&ip)
    }

    fn is_greylisted(&self, ip: IpAddr) -> bool {
        self.greylist.contains(&ip)
    }

    fn accept_connection(&self, peer: SocketAddr) -> bool {
        let ip = peer.ip();
        if self.is_blacklisted(ip) {
            return false;
        }
        self.is_whitelisted(ip) || !self.is_greylisted(ip)
    }

    fn blacklist(&self, ip: IpAddr) {
        self.blacklist.insert(ip);
    }
}

/// Default Bedrock-style MOTD string.
pub struct DefaultMotd {
    pub server_name: String,
}

impl MotdProvider for DefaultMotd {
    fn motd(&self, info: &ServerInfo, _peer: SocketAddr, edu: bool) -> String {
        let edition = if edu { "MCEE" } else { "MCPE" };
        format!(
            "{};{};11;1.0;{};{};{};jade;Survival;1;{};{};",
            edition,
            self.server_name,
            info.player_count,
            info.max_players,
            info.guid,
            info.port,
            info.port,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(last_octet: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 19132)
    }

    #[test]
    fn blacklist_rejects() {
        let lists = AdmissionLists::new();
        assert!(lists.accept_connection(peer(1)));

        lists.blacklist(peer(1).ip());
        assert!(lists.is_blacklisted(peer(1).ip()));
        assert!(!lists.accept_connection(peer(1)));
        assert!(lists.accept_connection(peer(2)));
    }

    #[test]
    fn whitelist_overrides_greylist() {
        let lists = AdmissionLists::new();
        lists.greylist(peer(3).ip());
        assert!(!lists.accept_connection(peer(3)));

        lists.whitelist(peer(3).ip());
        assert!(lists.accept_connection(peer(3)));
    }

    #[test]
    fn default_motd_formats() {
        let motd = DefaultMotd { server_name: "jade".into() };
        let info = ServerInfo { guid: 7, player_count: 2, max_players: 10, port: 19132 };
        let line = motd.motd(&info, peer(1), false);
        assert!(line.starts_with("MCPE;jade;"));
        let edu = motd.motd(&info, peer(1), true);
        assert!(edu.starts_with("MCEE;jade;"));
    }
}
