//! Datagram and frame (encapsulated message) wire codec.

use crate::error::{RakError, Result};
use crate::protocol::reliability::Reliability;
use bytes::{Buf, Bytes, BytesMut};
use jade_binary::{ByteReader, ByteWriter};

pub const FLAG_VALID: u8 = 0x80;
pub const FLAG_ACK: u8 = 0x40;
pub const FLAG_NAK: u8 = 0x20;
pub const FLAG_SPLIT: u8 = 0x10;

/// Number of independent ordering channels per session.
pub const NUM_ORDERING_CHANNELS: u8 = 32;

/// Flags byte (1) + 24-bit sequence number (3).
pub const DATAGRAM_HEADER_LEN: usize = 4;

/// Decoded datagram header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub is_valid: bool,
    pub is_ack: bool,
    pub is_nak: bool,
    pub has_split: bool,
}

impl DatagramHeader {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            is_valid: byte & FLAG_VALID != 0,
            is_ack: byte & FLAG_ACK != 0,
            is_nak: byte & FLAG_NAK != 0,
            has_split: byte & FLAG_SPLIT != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.is_valid {
            byte |= FLAG_VALID;
        }
        if self.is_ack {
            byte |= FLAG_ACK;
        }
        if self.is_nak {
            byte |= FLAG_NAK;
        }
        if self.has_split {
            byte |= FLAG_SPLIT;
        }
        byte
    }

    pub fn data(has_split: bool) -> Self {
        Self { is_valid: true, is_ack: false, is_nak: false, has_split }
    }
}

/// Split-reassembly descriptor carried by fragmented frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

/// Ordering descriptor carried by ordered and sequenced frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingInfo {
    pub index: u32,
    pub channel: u8,
}

/// One encapsulated message inside a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reliability: Reliability,
    /// Reliable message number, present for reliable classes.
    pub reliable_index: Option<u32>,
    /// Sequencing index, present for sequenced classes.
    pub sequence_index: Option<u32>,
    /// Ordering index and channel, present for ordered and sequenced classes.
    pub ordering: Option<OrderingInfo>,
    pub split: Option<SplitInfo>,
    pub body: Bytes,
}

impl Frame {
    /// A frame with no reliability metadata.
    pub fn unreliable(body: Bytes) -> Self {
        Self {
            reliability: Reliability::Unreliable,
            reliable_index: None,
            sequence_index: None,
            ordering: None,
            split: None,
            body,
        }
    }

    /// Size of the descriptor and conditional fields, excluding the body.
    pub fn header_len(&self) -> usize {
        let mut len = 1 + 2;
        if self.reliability.is_reliable() {
            len += 3;
        }
        if self.reliability.is_sequenced() {
            len += 3;
        }
        if self.reliability.carries_ordering() {
            len += 3 + 1;
        }
        if self.split.is_some() {
            len += 4 + 2 + 4;
        }
        len
    }

    pub fn wire_len(&self) -> usize {
        self.header_len() + self.body.len()
    }

    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let flags = reader.read_u8()?;
        let reliability = Reliability::from_bits(flags >> 5).ok_or_else(|| {
            RakError::MalformedDatagram(format!("bad reliability bits in {flags:#04x}"))
        })?;
        let is_split = flags & FLAG_SPLIT != 0;

        let length_bits = reader.read_u16_be()?;
        let length_bytes = (length_bits as usize).div_ceil(8);

        let reliable_index = if reliability.is_reliable() {
            Some(reader.read_u24_le()?)
        } else {
            None
        };
        let sequence_index = if reliability.is_sequenced() {
            Some(reader.read_u24_le()?)
        } else {
            None
        };
        let ordering = if reliability.carries_ordering() {
            let index = reader.read_u24_le()?;
            let channel = reader.read_u8()?;
            if channel >= NUM_ORDERING_CHANNELS {
                return Err(RakError::InvalidChannel(channel));
            }
            Some(OrderingInfo { index, channel })
        } else {
            None
        };
        let split = if is_split {
            Some(SplitInfo {
                count: reader.read_u32_be()?,
                id: reader.read_u16_be()?,
                index: reader.read_u32_be()?,
            })
        } else {
            None
        };

        let body = reader.read_bytes(length_bytes)?;

        Ok(Self {
            reliability,
            reliable_index,
            sequence_index,
            ordering,
            split,
            body,
        })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        let mut flags = (self.reliability as u8) << 5;
        if self.split.is_some() {
            flags |= FLAG_SPLIT;
        }
        writer.write_u8(flags)?;

        let length_bits = self
            .body
            .len()
            .checked_mul(8)
            .and_then(|bits| u16::try_from(bits).ok())
            .ok_or(RakError::FrameTooLarge(self.body.len()))?;
        writer.write_u16_be(length_bits)?;

        if self.reliability.is_reliable() {
            let index = self.reliable_index.ok_or_else(|| {
                RakError::MalformedDatagram("reliable frame without message number".into())
            })?;
            writer.write_u24_le(index)?;
        }
        if self.reliability.is_sequenced() {
            let index = self.sequence_index.ok_or_else(|| {
                RakError::MalformedDatagram("sequenced frame without sequence index".into())
            })?;
            writer.write_u24_le(index)?;
        }
        if self.reliability.carries_ordering() {
            let ordering = self.ordering.ok_or_else(|| {
                RakError::MalformedDatagram("ordered frame without ordering info".into())
            })?;
            writer.write_u24_le(ordering.index)?;
            writer.write_u8(ordering.channel)?;
        }
        if let Some(split) = self.split {
            writer.write_u32_be(split.count)?;
            writer.write_u16_be(split.id)?;
            writer.write_u32_be(split.index)?;
        }

        writer.write_bytes(&self.body)?;
        Ok(())
    }
}

/// One UDP payload carrying encapsulated messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub header: DatagramHeader,
    pub sequence: u32,
    pub frames: Vec<Frame>,
}

impl Datagram {
    pub fn new(sequence: u32) -> Self {
        Self {
            header: DatagramHeader::data(false),
            sequence,
            frames: Vec::new(),
        }
    }

    pub fn wire_len(&self) -> usize {
        DATAGRAM_HEADER_LEN + self.frames.iter().map(Frame::wire_len).sum::<usize>()
    }

    /// Decodes a full data datagram, including the header byte.
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let header = DatagramHeader::from_byte(reader.read_u8()?);
        if !header.is_valid {
            return Err(RakError::MalformedDatagram("valid flag not set".into()));
        }
        if header.is_ack || header.is_nak {
            return Err(RakError::MalformedDatagram(
                "ACK/NAK datagram on the data path".into(),
            ));
        }
        let sequence = reader.read_u24_le()?;

        let mut frames = Vec::new();
        while reader.has_remaining() {
            frames.push(Frame::decode(reader)?);
        }
        if frames.is_empty() {
            return Err(RakError::MalformedDatagram("datagram with no frames".into()));
        }

        Ok(Self { header, sequence, frames })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        writer.write_u8(self.header.to_byte())?;
        writer.write_u24_le(self.sequence)?;
        for frame in &self.frames {
            frame.encode(writer)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut writer = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut writer)?;
        Ok(writer.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_frame_wire_format() {
        let frame = Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(10),
            sequence_index: None,
            ordering: Some(OrderingInfo { index: 5, channel: 0 }),
            split: None,
            body: Bytes::from_static(&[0xFE, 0x01, 0x02, 0x03]),
        };

        let mut writer = BytesMut::new();
        frame.encode(&mut writer).unwrap();

        let expected: &[u8] = &[
            0x60, // reliability 3 << 5
            0x00, 0x20, // 32 bits
            0x0A, 0x00, 0x00, // reliable index 10, LE triad
            0x05, 0x00, 0x00, // ordering index 5, LE triad
            0x00, // channel 0
            0xFE, 0x01, 0x02, 0x03,
        ];
        assert_eq!(&writer[..], expected);

        let mut reader = writer.freeze();
        let decoded = Frame::decode(&mut reader).unwrap();
        assert_eq!(decoded, frame);
        assert!(!reader.has_remaining());
    }

    #[test]
    fn split_frame_wire_format() {
        let frame = Frame {
            reliability: Reliability::Reliable,
            reliable_index: Some(20),
            sequence_index: None,
            ordering: None,
            split: Some(SplitInfo { count: 2, id: 1234, index: 0 }),
            body: Bytes::from_static(&[0xAA, 0xBB, 0xCC]),
        };

        let mut writer = BytesMut::new();
        frame.encode(&mut writer).unwrap();

        let expected: &[u8] = &[
            0x50, // reliability 2 << 5 | split 0x10
            0x00, 0x18, // 24 bits
            0x14, 0x00, 0x00, // reliable index 20
            0x00, 0x00, 0x00, 0x02, // split count, u32 BE
            0x04, 0xD2, // split id 1234, u16 BE
            0x00, 0x00, 0x00, 0x00, // split index, u32 BE
            0xAA, 0xBB, 0xCC,
        ];
        assert_eq!(&writer[..], expected);

        let mut reader = writer.freeze();
        assert_eq!(Frame::decode(&mut reader).unwrap(), frame);
    }

    #[test]
    fn frame_header_len_matches_encoding() {
        let cases = [
            Frame::unreliable(Bytes::from_static(b"x")),
            Frame {
                reliability: Reliability::ReliableOrdered,
                reliable_index: Some(1),
                sequence_index: None,
                ordering: Some(OrderingInfo { index: 1, channel: 3 }),
                split: Some(SplitInfo { count: 4, id: 9, index: 2 }),
                body: Bytes::from_static(b"abc"),
            },
            Frame {
                reliability: Reliability::UnreliableSequenced,
                reliable_index: None,
                sequence_index: Some(7),
                ordering: Some(OrderingInfo { index: 7, channel: 1 }),
                split: None,
                body: Bytes::new(),
            },
        ];
        for frame in cases {
            let mut writer = BytesMut::new();
            frame.encode(&mut writer).unwrap();
            assert_eq!(writer.len(), frame.wire_len());
        }
    }

    #[test]
    fn illegal_ordering_channel_is_rejected() {
        let frame = Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(0),
            sequence_index: None,
            ordering: Some(OrderingInfo { index: 0, channel: 32 }),
            split: None,
            body: Bytes::new(),
        };
        let mut writer = BytesMut::new();
        frame.encode(&mut writer).unwrap();

        let mut reader = writer.freeze();
        assert!(matches!(
            Frame::decode(&mut reader),
            Err(RakError::InvalidChannel(32))
        ));
    }

    #[test]
    fn datagram_round_trip() {
        let mut datagram = Datagram::new(0x123456);
        datagram.frames.push(Frame::unreliable(Bytes::from_static(&[0x11, 0x22])));
        datagram.frames.push(Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(5),
            sequence_index: None,
            ordering: Some(OrderingInfo { index: 10, channel: 0 }),
            split: None,
            body: Bytes::from_static(&[0x33]),
        });

        let bytes = datagram.to_bytes().unwrap();
        assert_eq!(bytes.len(), datagram.wire_len());
        assert_eq!(bytes[0], FLAG_VALID);
        assert_eq!(&bytes[1..4], &[0x56, 0x34, 0x12]);

        let mut reader = bytes.clone();
        let decoded = Datagram::decode(&mut reader).unwrap();
        assert_eq!(decoded, datagram);

        // Round-trip law: re-encoding the decode yields the original bytes.
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn truncated_datagram_is_malformed() {
        let mut reader = Bytes::from_static(&[FLAG_VALID, 0x01, 0x00]);
        assert!(Datagram::decode(&mut reader).is_err());

        // Frame length field promises more payload than the buffer holds.
        let mut writer = BytesMut::new();
        writer.write_u8(FLAG_VALID).unwrap();
        writer.write_u24_le(1).unwrap();
        writer.write_u8(0x00).unwrap();
        writer.write_u16_be(8 * 5).unwrap();
        writer.write_bytes(&[0x01, 0x02, 0x03]).unwrap();
        let mut reader = writer.freeze();
        assert!(Datagram::decode(&mut reader).is_err());
    }

    #[test]
    fn ack_header_rejected_on_data_path() {
        let mut reader = Bytes::from_static(&[FLAG_VALID | FLAG_ACK, 0x00, 0x00, 0x00]);
        assert!(matches!(
            Datagram::decode(&mut reader),
            Err(RakError::MalformedDatagram(_))
        ));
    }
}
