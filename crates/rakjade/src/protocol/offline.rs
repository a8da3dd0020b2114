//! Offline (unconnected) message codecs.
//!
//! Every message here carries the 16-byte offline magic; a missing or wrong
//! magic fails the decode.

use crate::error::{RakError, Result};
use crate::protocol::ids;
use bytes::{Buf, Bytes, BytesMut};
use jade_binary::{ByteReader, ByteWriter};
use std::net::SocketAddr;

fn expect_magic(reader: &mut Bytes) -> Result<()> {
    if reader.read_magic()? {
        Ok(())
    } else {
        Err(RakError::MalformedDatagram("bad offline magic".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPing {
    /// Peer-side send timestamp, echoed back in the pong.
    pub time: i64,
    pub client_guid: u64,
}

impl UnconnectedPing {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let time = reader.read_i64_be()?;
        expect_magic(reader)?;
        let client_guid = reader.read_u64_be()?;
        Ok(Self { time, client_guid })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::UNCONNECTED_PING)?;
        writer.write_i64_be(self.time)?;
        writer.write_magic()?;
        writer.write_u64_be(self.client_guid)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub time: i64,
    pub server_guid: u64,
    pub motd: String,
}

impl UnconnectedPong {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let time = reader.read_i64_be()?;
        let server_guid = reader.read_u64_be()?;
        expect_magic(reader)?;
        let motd = reader.read_string()?;
        Ok(Self { time, server_guid, motd })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::UNCONNECTED_PONG)?;
        writer.write_i64_be(self.time)?;
        writer.write_u64_be(self.server_guid)?;
        writer.write_magic()?;
        writer.write_string(&self.motd)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest1 {
    pub protocol_version: u8,
    /// Number of padding bytes the client appended to probe the path MTU.
    pub padding: usize,
}

impl OpenConnectionRequest1 {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        expect_magic(reader)?;
        let protocol_version = reader.read_u8()?;
        let padding = reader.remaining();
        reader.advance(padding);
        Ok(Self { protocol_version, padding })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::OPEN_CONNECTION_REQUEST_1)?;
        writer.write_magic()?;
        writer.write_u8(self.protocol_version)?;
        writer.write_bytes(&vec![0u8; self.padding])?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply1 {
    pub server_guid: u64,
    pub server_has_security: bool,
    pub mtu: u16,
}

impl OpenConnectionReply1 {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        expect_magic(reader)?;
        let server_guid = reader.read_u64_be()?;
        let server_has_security = reader.read_bool()?;
        let mtu = reader.read_u16_be()?;
        Ok(Self { server_guid, server_has_security, mtu })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::OPEN_CONNECTION_REPLY_1)?;
        writer.write_magic()?;
        writer.write_u64_be(self.server_guid)?;
        writer.write_bool(self.server_has_security)?;
        writer.write_u16_be(self.mtu)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest2 {
    /// The server endpoint as the client sees it.
    pub server_address: SocketAddr,
    pub mtu: u16,
    pub client_guid: u64,
}

impl OpenConnectionRequest2 {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        expect_magic(reader)?;
        let server_address = reader.read_socket_addr()?;
        let mtu = reader.read_u16_be()?;
        let client_guid = reader.read_u64_be()?;
        Ok(Self { server_address, mtu, client_guid })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::OPEN_CONNECTION_REQUEST_2)?;
        writer.write_magic()?;
        writer.write_socket_addr(&self.server_address)?;
        writer.write_u16_be(self.mtu)?;
        writer.write_u64_be(self.client_guid)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply2 {
    pub server_guid: u64,
    /// The peer endpoint echoed back.
    pub client_address: SocketAddr,
    pub mtu: u16,
    pub server_has_security: bool,
}

impl OpenConnectionReply2 {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        expect_magic(reader)?;
        let server_guid = reader.read_u64_be()?;
        let client_address = reader.read_socket_addr()?;
        let mtu = reader.read_u16_be()?;
        let server_has_security = reader.read_bool()?;
        Ok(Self { server_guid, client_address, mtu, server_has_security })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::OPEN_CONNECTION_REPLY_2)?;
        writer.write_magic()?;
        writer.write_u64_be(self.server_guid)?;
        writer.write_socket_addr(&self.client_address)?;
        writer.write_u16_be(self.mtu)?;
        writer.write_bool(self.server_has_security)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompatibleProtocolVersion {
    pub server_protocol: u8,
    pub server_guid: u64,
}

impl IncompatibleProtocolVersion {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let server_protocol = reader.read_u8()?;
        expect_magic(reader)?;
        let server_guid = reader.read_u64_be()?;
        Ok(Self { server_protocol, server_guid })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::INCOMPATIBLE_PROTOCOL_VERSION)?;
        writer.write_u8(self.server_protocol)?;
        writer.write_magic()?;
        writer.write_u64_be(self.server_guid)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoFreeIncomingConnections {
    pub server_guid: u64,
}

impl NoFreeIncomingConnections {
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        expect_magic(reader)?;
        let server_guid = reader.read_u64_be()?;
        Ok(Self { server_guid })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(ids::NO_FREE_INCOMING_CONNECTIONS)?;
        writer.write_magic()?;
        writer.write_u64_be(self.server_guid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn round_trip<T, D, E>(value: &T, decode: D, encode: E, id: u8) -> T
    where
        D: Fn(&mut Bytes) -> Result<T>,
        E: Fn(&T, &mut BytesMut) -> Result<()>,
    {
        let mut writer = BytesMut::new();
        encode(value, &mut writer).unwrap();
        let bytes = writer.freeze();
        assert_eq!(bytes[0], id);
        let mut reader = bytes.slice(1..);
        let decoded = decode(&mut reader).unwrap();
        assert!(!reader.has_remaining());
        decoded
    }

    #[test]
    fn unconnected_ping_pong_round_trip() {
        let ping = UnconnectedPing { time: 123456789, client_guid: 42 };
        let decoded = round_trip(
            &ping,
            UnconnectedPing::decode,
            UnconnectedPing::encode,
            ids::UNCONNECTED_PING,
        );
        assert_eq!(decoded, ping);

        let pong = UnconnectedPong {
            time: 123456789,
            server_guid: 12345,
            motd: "MCPE;jade;11;1.0;0;1000".into(),
        };
        let decoded = round_trip(
            &pong,
            UnconnectedPong::decode,
            UnconnectedPong::encode,
            ids::UNCONNECTED_PONG,
        );
        assert_eq!(decoded, pong);
    }

    #[test]
    fn open_connection_stage_1_round_trip() {
        let request = OpenConnectionRequest1 { protocol_version: 11, padding: 1372 };
        let decoded = round_trip(
            &request,
            OpenConnectionRequest1::decode,
            OpenConnectionRequest1::encode,
            ids::OPEN_CONNECTION_REQUEST_1,
        );
        assert_eq!(decoded, request);

        let reply = OpenConnectionReply1 {
            server_guid: 12345,
            server_has_security: false,
            mtu: 1400,
        };
        let decoded = round_trip(
            &reply,
            OpenConnectionReply1::decode,
            OpenConnectionReply1::encode,
            ids::OPEN_CONNECTION_REPLY_1,
        );
        assert_eq!(decoded, reply);
    }

    #[test]
    fn open_connection_stage_2_round_trip() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 19132);
        let request = OpenConnectionRequest2 {
            server_address: addr,
            mtu: 1400,
            client_guid: 42,
        };
        let decoded = round_trip(
            &request,
            OpenConnectionRequest2::decode,
            OpenConnectionRequest2::encode,
            ids::OPEN_CONNECTION_REQUEST_2,
        );
        assert_eq!(decoded, request);

        let reply = OpenConnectionReply2 {
            server_guid: 12345,
            client_address: addr,
            mtu: 1400,
            server_has_security: false,
        };
        let decoded = round_trip(
            &reply,
            OpenConnectionReply2::decode,
            OpenConnectionReply2::encode,
            ids::OPEN_CONNECTION_REPLY_2,
        );
        assert_eq!(decoded, reply);
    }

    #[test]
    fn rejection_messages_round_trip() {
        let incompatible = IncompatibleProtocolVersion { server_protocol: 11, server_guid: 7 };
        let decoded = round_trip(
            &incompatible,
            IncompatibleProtocolVersion::decode,
            IncompatibleProtocolVersion::encode,
            ids::INCOMPATIBLE_PROTOCOL_VERSION,
        );
        assert_eq!(decoded, incompatible);

        let no_free = NoFreeIncomingConnections { server_guid: 7 };
        let decoded = round_trip(
            &no_free,
            NoFreeIncomingConnections::decode,
            NoFreeIncomingConnections::encode,
            ids::NO_FREE_INCOMING_CONNECTIONS,
        );
        assert_eq!(decoded, no_free);
    }

    #[test]
    fn bad_magic_fails_decode() {
        let mut writer = BytesMut::new();
        writer.write_i64_be(1).unwrap();
        writer.write_bytes(&[0u8; 16]).unwrap();
        writer.write_u64_be(42).unwrap();

        let mut reader = writer.freeze();
        assert!(matches!(
            UnconnectedPing::decode(&mut reader),
            Err(RakError::MalformedDatagram(_))
        ));
    }
}
