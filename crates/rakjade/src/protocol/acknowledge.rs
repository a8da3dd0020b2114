//! ACK/NAK range-list codec.
//!
//! Wire shape: u16 BE record count, then per record a flag byte (0x01 for a
//! single sequence number, 0x00 for an inclusive range) and one or two
//! 24-bit LE sequence numbers.

use crate::error::{RakError, Result};
use crate::protocol::datagram::{FLAG_ACK, FLAG_NAK, FLAG_VALID};
use bytes::{Bytes, BytesMut};
use jade_binary::{ByteReader, ByteWriter};

pub const ACK_HEADER: u8 = FLAG_VALID | FLAG_ACK;
pub const NAK_HEADER: u8 = FLAG_VALID | FLAG_NAK;

/// Decode guard against hostile range lists.
const MAX_RECORDS: usize = 4096;
/// Widest inclusive range a single record may cover.
const MAX_RANGE_SPAN: u32 = 512;

/// A list of inclusive sequence-number ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeList {
    ranges: Vec<(u32, u32)>,
}

impl RangeList {
    /// Builds a list from sorted sequence numbers, coalescing consecutive
    /// values into ranges. Duplicates are tolerated.
    pub fn from_sorted(sorted: &[u32]) -> Self {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for &seq in sorted {
            match ranges.last_mut() {
                Some((_, end)) if seq == *end => {}
                Some((_, end)) if seq == end.wrapping_add(1) => *end = seq,
                _ => ranges.push((seq, seq)),
            }
        }
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Every sequence number covered, in list order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..=end)
    }

    /// Record count (2) plus the per-record encodings.
    pub fn wire_len(&self) -> usize {
        2 + self
            .ranges
            .iter()
            .map(|&(start, end)| if start == end { 1 + 3 } else { 1 + 3 + 3 })
            .sum::<usize>()
    }

    /// Splits the list so that every piece encodes into at most `max_wire`
    /// bytes; a backlog of acknowledgements then spans several datagrams.
    pub fn into_chunks(self, max_wire: usize) -> Vec<RangeList> {
        let mut chunks = Vec::new();
        let mut current = RangeList::default();
        let mut used = 2usize;
        for range in self.ranges {
            let cost = if range.0 == range.1 { 1 + 3 } else { 1 + 3 + 3 };
            if used + cost > max_wire && !current.ranges.is_empty() {
                chunks.push(std::mem::take(&mut current));
                used = 2;
            }
            used += cost;
            current.ranges.push(range);
        }
        if !current.ranges.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let record_count = reader.read_u16_be()? as usize;
        if record_count > MAX_RECORDS {
            return Err(RakError::MalformedDatagram(format!(
                "range list with {record_count} records"
            )));
        }

        let mut ranges = Vec::with_capacity(record_count.min(64));
        for _ in 0..record_count {
            match reader.read_u8()? {
                0x01 => {
                    let seq = reader.read_u24_le()?;
                    ranges.push((seq, seq));
                }
                0x00 => {
                    let start = reader.read_u24_le()?;
                    let end = reader.read_u24_le()?;
                    if start > end {
                        return Err(RakError::MalformedDatagram(format!(
                            "range start {start} > end {end}"
                        )));
                    }
                    if end - start > MAX_RANGE_SPAN {
                        return Err(RakError::MalformedDatagram(format!(
                            "range spans {} sequence numbers",
                            end - start + 1
                        )));
                    }
                    ranges.push((start, end));
                }
                other => {
                    return Err(RakError::MalformedDatagram(format!(
                        "unknown range record flag {other:#04x}"
                    )));
                }
            }
        }
        Ok(Self { ranges })
    }

    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        let count: u16 = self
            .ranges
            .len()
            .try_into()
            .map_err(|_| RakError::MalformedDatagram("too many range records".into()))?;
        writer.write_u16_be(count)?;
        for &(start, end) in &self.ranges {
            if start == end {
                writer.write_u8(0x01)?;
                writer.write_u24_le(start)?;
            } else {
                writer.write_u8(0x00)?;
                writer.write_u24_le(start)?;
                writer.write_u24_le(end)?;
            }
        }
        Ok(())
    }
}

/// An ACK or NAK datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledge {
    pub is_nak: bool,
    pub ranges: RangeList,
}

impl Acknowledge {
    pub fn ack(ranges: RangeList) -> Self {
        Self { is_nak: false, ranges }
    }

    pub fn nak(ranges: RangeList) -> Self {
        Self { is_nak: true, ranges }
    }

    /// Decodes the body after the header byte has been consumed.
    pub fn decode(reader: &mut Bytes, is_nak: bool) -> Result<Self> {
        Ok(Self {
            is_nak,
            ranges: RangeList::decode(reader)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut writer = BytesMut::with_capacity(1 + self.ranges.wire_len());
        writer.write_u8(if self.is_nak { NAK_HEADER } else { ACK_HEADER })?;
        self.ranges.encode(&mut writer)?;
        Ok(writer.freeze())
    }
}
