use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// The RakNet protocol version this server speaks.
pub const RAKNET_PROTOCOL_VERSION: u8 = 11;

/// Smallest MTU a peer may negotiate.
pub const MIN_MTU: u16 = 576;
/// Largest MTU a peer may negotiate.
pub const MAX_MTU: u16 = 1500;

/// Packet-trace filtering. Verbosity 0 disables tracing, 1 logs message id,
/// peer and size, 2 additionally dumps a payload prefix.
#[derive(Clone, Debug, Default)]
pub struct PacketTraceConfig {
    /// Message ids to trace. Empty means every id not excluded.
    pub include: Vec<u8>,
    /// Message ids never traced.
    pub exclude: Vec<u8>,
    pub verbosity: u8,
}

/// Configuration for a [`RakServer`](crate::server::RakServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub ip: IpAddr,
    pub port: u16,
    /// Maximum number of established sessions.
    pub max_players: usize,
    /// Maximum number of handshakes allowed in flight at once.
    pub max_concurrent_connects: usize,
    /// A session whose last received datagram is older than this is evicted.
    pub inactivity_timeout: Duration,
    /// Deliver reliable-ordered messages through a per-session delivery task
    /// instead of on the datagram worker.
    pub force_ordering_for_all: bool,
    /// Answer unconnected pings with a second, EDU-flavored pong.
    pub enable_edu: bool,
    /// Hand 0xFE datagrams to the query responder.
    pub enable_query: bool,
    pub trace_packets: PacketTraceConfig,
    /// Server GUID; a random one is generated when unset.
    pub server_guid: Option<u64>,
    /// Upper bound applied to client-proposed MTUs, within [`MIN_MTU`]..=[`MAX_MTU`].
    pub mtu: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 19132,
            max_players: 1000,
            max_concurrent_connects: 1000,
            inactivity_timeout: Duration::from_millis(8500),
            force_ordering_for_all: false,
            enable_edu: false,
            enable_query: false,
            trace_packets: PacketTraceConfig::default(),
            server_guid: None,
            mtu: 1400,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Clamps a peer-proposed MTU into the server's accepted range.
    pub fn clamp_mtu(&self, proposed: u16) -> u16 {
        let upper = self.mtu.clamp(MIN_MTU, MAX_MTU);
        proposed.clamp(MIN_MTU, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 19132);
        assert_eq!(config.max_players, 1000);
        assert_eq!(config.inactivity_timeout, Duration::from_millis(8500));
        assert!(!config.force_ordering_for_all);
    }

    #[test]
    fn mtu_clamp() {
        let config = ServerConfig::default();
        assert_eq!(config.clamp_mtu(400), MIN_MTU);
        assert_eq!(config.clamp_mtu(1400), 1400);
        assert_eq!(config.clamp_mtu(9000), 1400);
    }
}
