//! # rakjade
//!
//! Reliable-datagram transport server speaking the RakNet framing protocol
//! used by Minecraft Bedrock clients. The crate owns the UDP socket, the
//! per-peer reliability state (sequencing, acknowledgement, retransmission,
//! split reassembly, ordered delivery), and the open-connection handshake;
//! application messages are exchanged with the layer above through the
//! [`handler`] traits.

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod protocol;
pub mod seq;
pub mod server;
pub mod session;
pub mod trace;

pub use config::{PacketTraceConfig, ServerConfig, RAKNET_PROTOCOL_VERSION};
pub use error::{RakError, Result};
pub use handler::{
    AdmissionController, AdmissionLists, DefaultMotd, DisconnectReason, MessageCodec,
    MotdProvider, QueryResponder, ServerInfo, SessionEvents,
};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use protocol::Reliability;
pub use server::RakServer;
pub use session::{SessionHandle, SessionState};
