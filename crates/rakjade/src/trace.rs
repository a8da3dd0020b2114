//! Packet tracing, gated by the `trace_packets` configuration.

use crate::config::PacketTraceConfig;
use log::debug;
use std::net::SocketAddr;

/// Direction tag used in trace lines.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::In => "recv",
            Direction::Out => "send",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PacketTrace {
    include: Vec<u8>,
    exclude: Vec<u8>,
    verbosity: u8,
}

impl PacketTrace {
    pub fn new(config: &PacketTraceConfig) -> Self {
        Self {
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            verbosity: config.verbosity,
        }
    }

    /// Whether datagrams with this leading id should be traced.
    pub fn matches(&self, id: u8) -> bool {
        if self.verbosity == 0 || self.exclude.contains(&id) {
            return false;
        }
        self.include.is_empty() || self.include.contains(&id)
    }

    pub fn log(&self, direction: Direction, peer: SocketAddr, payload: &[u8]) {
        let Some(&id) = payload.first() else { return };
        if !self.matches(id) {
            return;
        }
        if self.verbosity >= 2 {
            let prefix = &payload[..payload.len().min(32)];
            debug!(
                "{} {:#04x} {} ({} bytes) {:02X?}",
                direction.label(),
                id,
                peer,
                payload.len(),
                prefix
            );
        } else {
            debug!(
                "{} {:#04x} {} ({} bytes)",
                direction.label(),
                id,
                peer,
                payload.len()
            );
        }
    }
}
