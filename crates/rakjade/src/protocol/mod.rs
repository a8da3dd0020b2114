//! Wire protocol: datagram framing, ACK/NAK range lists, offline handshake
//! messages, and in-session control messages.

pub mod acknowledge;
pub mod connected;
pub mod datagram;
pub mod offline;
pub mod reliability;

pub use acknowledge::{Acknowledge, RangeList, ACK_HEADER, NAK_HEADER};
pub use datagram::{
    Datagram, DatagramHeader, Frame, OrderingInfo, SplitInfo, DATAGRAM_HEADER_LEN,
    FLAG_ACK, FLAG_NAK, FLAG_SPLIT, FLAG_VALID, NUM_ORDERING_CHANNELS,
};
pub use reliability::Reliability;

/// Message ids. Everything below [`ids::OFFLINE_BOUNDARY`] arriving outside a
/// datagram is an offline message; 0x80 and above is a framed datagram.
pub mod ids {
    pub const CONNECTED_PING: u8 = 0x00;
    pub const UNCONNECTED_PING: u8 = 0x01;
    pub const CONNECTED_PONG: u8 = 0x03;
    pub const OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
    pub const OPEN_CONNECTION_REPLY_1: u8 = 0x06;
    pub const OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
    pub const OPEN_CONNECTION_REPLY_2: u8 = 0x08;
    pub const CONNECTION_REQUEST: u8 = 0x09;
    pub const CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
    pub const NEW_INCOMING_CONNECTION: u8 = 0x13;
    pub const NO_FREE_INCOMING_CONNECTIONS: u8 = 0x14;
    pub const DISCONNECT_NOTIFICATION: u8 = 0x15;
    pub const INCOMPATIBLE_PROTOCOL_VERSION: u8 = 0x19;
    pub const UNCONNECTED_PONG: u8 = 0x1c;

    /// First byte of a query protocol datagram.
    pub const QUERY_MAGIC: u8 = 0xFE;

    /// Ids below this are offline messages when received outside a session
    /// datagram.
    pub const OFFLINE_BOUNDARY: u8 = 0x80;
}
