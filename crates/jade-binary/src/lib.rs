//! Byte-level IO for the jade server family.
//!
//! Extension traits over `bytes::Buf`/`BufMut` covering the primitives the
//! RakNet wire format needs: 24-bit little-endian triads, the inverted-IPv4
//! address encoding, the 16-byte offline magic, and u16-length-prefixed
//! strings.

pub mod error;
pub mod io;

pub use error::{BinaryError, Result};
pub use io::{ByteReader, ByteWriter, OFFLINE_MAGIC};
