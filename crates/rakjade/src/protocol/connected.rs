//! In-session control messages, carried inside frames.

use crate::error::Result;
use crate::protocol::ids;
use bytes::{Buf, Bytes, BytesMut};
use jade_binary::{ByteReader, ByteWriter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Number of system addresses in a `ConnectionRequestAccepted`.
pub const SYSTEM_ADDRESS_COUNT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPing {
    pub time: i64,
}

impl ConnectedPing {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        Ok(Self { time: reader.read_i64_be()? })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::CONNECTED_PING)?;
        writer.write_i64_be(self.time)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPong {
    pub ping_time: i64,
    pub pong_time: i64,
}

impl ConnectedPong {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        Ok(Self {
            ping_time: reader.read_i64_be()?,
            pong_time: reader.read_i64_be()?,
        })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::CONNECTED_PONG)?;
        writer.write_i64_be(self.ping_time)?;
        writer.write_i64_be(self.pong_time)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub client_guid: u64,
    pub time: i64,
    pub use_security: bool,
}

impl ConnectionRequest {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        Ok(Self {
            client_guid: reader.read_u64_be()?,
            time: reader.read_i64_be()?,
            use_security: reader.read_bool()?,
        })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::CONNECTION_REQUEST)?;
        writer.write_u64_be(self.client_guid)?;
        writer.write_i64_be(self.time)?;
        writer.write_bool(self.use_security)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub system_index: u16,
    pub system_addresses: [SocketAddr; SYSTEM_ADDRESS_COUNT],
    pub request_time: i64,
    pub time: i64,
}

impl ConnectionRequestAccepted {
    pub fn new(client_address: SocketAddr, request_time: i64, time: i64) -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            client_address,
            system_index: 0,
            system_addresses: [unspecified; SYSTEM_ADDRESS_COUNT],
            request_time,
            time,
        }
    }

    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let client_address = reader.read_socket_addr()?;
        let system_index = reader.read_u16_be()?;
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let mut system_addresses = [unspecified; SYSTEM_ADDRESS_COUNT];
        for slot in system_addresses.iter_mut() {
            *slot = reader.read_socket_addr()?;
        }
        let request_time = reader.read_i64_be()?;
        let time = reader.read_i64_be()?;
        Ok(Self {
            client_address,
            system_index,
            system_addresses,
            request_time,
            time,
        })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::CONNECTION_REQUEST_ACCEPTED)?;
        writer.write_socket_addr(&self.client_address)?;
        writer.write_u16_be(self.system_index)?;
        for addr in &self.system_addresses {
            writer.write_socket_addr(addr)?;
        }
        writer.write_i64_be(self.request_time)?;
        writer.write_i64_be(self.time)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncomingConnection {
    pub server_address: SocketAddr,
}

impl NewIncomingConnection {
    /// Decodes the server address; the trailing internal addresses and
    /// timestamps vary by client and are not needed here.
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        Ok(Self { server_address: reader.read_socket_addr()? })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::NEW_INCOMING_CONNECTION)?;
        writer.write_socket_addr(&self.server_address)?;
        Ok(())
    }
}

/// `DisconnectNotification` has no body; only the id byte is written.
pub fn encode_disconnect_notification(writer: &mut BytesMut) -> Result<()> {
    writer.write_u8(ids::DISCONNECT_NOTIFICATION)?;
    Ok(())
}
