use jade_binary::BinaryError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the transport core.
#[derive(Error, Debug)]
pub enum RakError {
    /// An I/O error on the underlying UDP socket.
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    /// A binary read or write failed.
    #[error("binary handling error: {0}")]
    Binary(#[from] BinaryError),

    /// A datagram did not parse as any known shape.
    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    /// A frame named an ordering channel outside 0..32.
    #[error("illegal ordering channel: {0}")]
    InvalidChannel(u8),

    /// A frame body does not fit the negotiated MTU even after splitting.
    #[error("frame body too large: {0} bytes")]
    FrameTooLarge(usize),

    /// A split frame carried inconsistent or out-of-bounds reassembly fields.
    #[error("invalid split frame: {0}")]
    InvalidSplit(String),

    /// The peer has too many incomplete split messages in flight.
    #[error("exceeded maximum concurrent split reassemblies")]
    TooManySplits,

    /// No session exists for the peer address.
    #[error("session not found for {0}")]
    SessionNotFound(SocketAddr),

    /// The session was evicted and accepts no further operations.
    #[error("session evicted")]
    SessionEvicted,
}

pub type Result<T> = std::result::Result<T, RakError>;
