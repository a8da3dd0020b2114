//! Reassembly of split (fragmented) frames.

use crate::error::{RakError, Result};
use crate::protocol::datagram::Frame;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Upper bound on concurrently reassembling split messages per session.
pub const MAX_ACTIVE_SPLITS: usize = 64;
/// Upper bound on parts per split message.
pub const MAX_SPLIT_PARTS: u32 = 512;
/// A reassembly older than this is discarded by the cleaner.
pub const SPLIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct SplitBuffer {
    parts: Vec<Option<Bytes>>,
    received: u32,
    first_seen: Instant,
    /// Frame carrying the reliability and ordering metadata every part
    /// shares; the completed message is delivered with it.
    template: Frame,
}

/// Per-session split reassembly state.
#[derive(Debug, Default)]
pub struct SplitAssembler {
    buffers: HashMap<u16, SplitBuffer>,
}

impl SplitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.buffers.len()
    }

    /// Accepts one split frame. Returns the completed message once all parts
    /// with the same split id have arrived; re-sent parts are ignored.
    pub fn insert(&mut self, frame: Frame, now: Instant) -> Result<Option<Frame>> {
        let split = frame
            .split
            .ok_or_else(|| RakError::InvalidSplit("frame without split descriptor".into()))?;

        if split.count == 0 || split.count > MAX_SPLIT_PARTS {
            return Err(RakError::InvalidSplit(format!(
                "split count {} out of bounds",
                split.count
            )));
        }
        if split.index >= split.count {
            return Err(RakError::InvalidSplit(format!(
                "split index {} >= count {}",
                split.index, split.count
            )));
        }

        match self.buffers.get(&split.id) {
            Some(existing) if existing.parts.len() != split.count as usize => {
                self.buffers.remove(&split.id);
                return Err(RakError::InvalidSplit(format!(
                    "split id {} changed part count",
                    split.id
                )));
            }
            Some(_) => {}
            None => {
                if self.buffers.len() >= MAX_ACTIVE_SPLITS {
                    return Err(RakError::TooManySplits);
                }
                let mut template = frame.clone();
                template.split = None;
                template.body = Bytes::new();
                self.buffers.insert(
                    split.id,
                    SplitBuffer {
                        parts: vec![None; split.count as usize],
                        received: 0,
                        first_seen: now,
                        template,
                    },
                );
            }
        }
        let buffer = self
            .buffers
            .get_mut(&split.id)
            .ok_or_else(|| RakError::InvalidSplit("split buffer vanished".into()))?;

        let slot = &mut buffer.parts[split.index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(frame.body);
        buffer.received += 1;

        if buffer.received < split.count {
            return Ok(None);
        }

        let buffer = self
            .buffers
            .remove(&split.id)
            .ok_or_else(|| RakError::InvalidSplit("split buffer vanished".into()))?;
        let total: usize = buffer
            .parts
            .iter()
            .map(|part| part.as_ref().map_or(0, Bytes::len))
            .sum();
        let mut body = BytesMut::with_capacity(total);
        for part in buffer.parts {
            let part = part.ok_or_else(|| {
                RakError::InvalidSplit("completed split with a missing part".into())
            })?;
            body.extend_from_slice(&part);
        }

        let mut completed = buffer.template;
        completed.body = body.freeze();
        Ok(Some(completed))
    }

    /// Discards reassemblies whose first part is older than [`SPLIT_TIMEOUT`].
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now.duration_since(buffer.first_seen) <= SPLIT_TIMEOUT);
        before - self.buffers.len()
    }
}
