use crate::error::{BinaryError, Result};
use bytes::{Buf, BufMut, Bytes};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// The 16-byte magic carried by every offline (unconnected) RakNet message.
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

macro_rules! check_remaining {
    ($buf:expr, $len:expr) => {
        let needed = $len;
        let remaining = $buf.remaining();
        if remaining < needed {
            return Err(BinaryError::UnexpectedEof { needed, remaining });
        }
    };
}

/// Extension trait for `bytes::Buf` with checked reads of the wire primitives.
pub trait ByteReader: Buf {
    #[inline]
    fn read_u8(&mut self) -> Result<u8> {
        check_remaining!(self, 1);
        Ok(self.get_u8())
    }

    #[inline]
    fn read_i8(&mut self) -> Result<i8> {
        check_remaining!(self, 1);
        Ok(self.get_i8())
    }

    /// Reads a single byte as a boolean (`0x00` is false, anything else true).
    #[inline]
    fn read_bool(&mut self) -> Result<bool> {
        check_remaining!(self, 1);
        Ok(self.get_u8() != 0)
    }

    #[inline]
    fn read_u16_be(&mut self) -> Result<u16> {
        check_remaining!(self, 2);
        Ok(self.get_u16())
    }

    #[inline]
    fn read_u16_le(&mut self) -> Result<u16> {
        check_remaining!(self, 2);
        Ok(self.get_u16_le())
    }

    /// Reads a 24-bit little-endian unsigned integer (triad) into a `u32`.
    #[inline]
    fn read_u24_le(&mut self) -> Result<u32> {
        check_remaining!(self, 3);
        Ok(self.get_uint_le(3) as u32)
    }

    #[inline]
    fn read_u32_be(&mut self) -> Result<u32> {
        check_remaining!(self, 4);
        Ok(self.get_u32())
    }

    #[inline]
    fn read_u64_be(&mut self) -> Result<u64> {
        check_remaining!(self, 8);
        Ok(self.get_u64())
    }

    #[inline]
    fn read_i64_be(&mut self) -> Result<i64> {
        check_remaining!(self, 8);
        Ok(self.get_i64())
    }

    /// Reads a byte slice with a fixed length, without copying when possible.
    #[inline]
    fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        check_remaining!(self, len);
        Ok(self.copy_to_bytes(len))
    }

    /// Reads a UTF-8 string prefixed with a big-endian `u16` length.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16_be()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Reads 16 bytes and compares them against [`OFFLINE_MAGIC`].
    fn read_magic(&mut self) -> Result<bool> {
        check_remaining!(self, 16);
        let mut magic = [0u8; 16];
        self.copy_to_slice(&mut magic);
        Ok(magic == OFFLINE_MAGIC)
    }

    /// Reads a socket address in RakNet wire format.
    ///
    /// IPv4: type byte 4, the four octets bitwise-inverted, port BE.
    /// IPv6: type byte 6, family u16 LE, port BE, flowinfo BE, 16 octets,
    /// scope id BE.
    fn read_socket_addr(&mut self) -> Result<SocketAddr> {
        let addr_type = self.read_u8()?;
        match addr_type {
            4 => {
                check_remaining!(self, 6);
                let mut octets = [0u8; 4];
                self.copy_to_slice(&mut octets);
                for byte in octets.iter_mut() {
                    *byte = !*byte;
                }
                let port = self.read_u16_be()?;
                Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
            }
            6 => {
                check_remaining!(self, 2 + 2 + 4 + 16 + 4);
                let _family = self.read_u16_le()?;
                let port = self.read_u16_be()?;
                let flowinfo = self.read_u32_be()?;
                let mut octets = [0u8; 16];
                self.copy_to_slice(&mut octets);
                let scope_id = self.read_u32_be()?;
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            other => Err(BinaryError::InvalidData(format!(
                "unknown address type: {other}"
            ))),
        }
    }
}

impl<B: Buf + ?Sized> ByteReader for B {}

/// Extension trait for `bytes::BufMut` mirroring [`ByteReader`].
///
/// Writes into a growable buffer cannot run out of space, but the methods
/// return `Result` so codec code reads uniformly on both directions.
pub trait ByteWriter: BufMut {
    #[inline]
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put_u8(value);
        Ok(())
    }

    #[inline]
    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.put_i8(value);
        Ok(())
    }

    #[inline]
    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.put_u8(u8::from(value));
        Ok(())
    }

    #[inline]
    fn write_u16_be(&mut self, value: u16) -> Result<()> {
        self.put_u16(value);
        Ok(())
    }

    #[inline]
    fn write_u16_le(&mut self, value: u16) -> Result<()> {
        self.put_u16_le(value);
        Ok(())
    }

    /// Writes the low 24 bits of `value` as a little-endian triad.
    #[inline]
    fn write_u24_le(&mut self, value: u32) -> Result<()> {
        self.put_uint_le(u64::from(value & 0x00FF_FFFF), 3);
        Ok(())
    }

    #[inline]
    fn write_u32_be(&mut self, value: u32) -> Result<()> {
        self.put_u32(value);
        Ok(())
    }

    #[inline]
    fn write_u64_be(&mut self, value: u64) -> Result<()> {
        self.put_u64(value);
        Ok(())
    }

    #[inline]
    fn write_i64_be(&mut self, value: i64) -> Result<()> {
        self.put_i64(value);
        Ok(())
    }

    #[inline]
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_slice(bytes);
        Ok(())
    }

    /// Writes a UTF-8 string prefixed with a big-endian `u16` length.
    fn write_string(&mut self, value: &str) -> Result<()> {
        let len: u16 = value
            .len()
            .try_into()
            .map_err(|_| BinaryError::InvalidData(format!("string too long: {} bytes", value.len())))?;
        self.put_u16(len);
        self.put_slice(value.as_bytes());
        Ok(())
    }

    #[inline]
    fn write_magic(&mut self) -> Result<()> {
        self.put_slice(&OFFLINE_MAGIC);
        Ok(())
    }

    /// Writes a socket address in RakNet wire format (see [`ByteReader::read_socket_addr`]).
    fn write_socket_addr(&mut self, addr: &SocketAddr) -> Result<()> {
        match addr {
            SocketAddr::V4(v4) => {
                self.put_u8(4);
                for byte in v4.ip().octets() {
                    self.put_u8(!byte);
                }
                self.put_u16(v4.port());
            }
            SocketAddr::V6(v6) => {
                self.put_u8(6);
                self.put_u16_le(23);
                self.put_u16(v6.port());
                self.put_u32(v6.flowinfo());
                self.put_slice(&v6.ip().octets());
                self.put_u32(v6.scope_id());
            }
        }
        Ok(())
    }
}

impl<B: BufMut + ?Sized> ByteWriter for B {}
