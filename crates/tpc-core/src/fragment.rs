//! Reassembly of fragmented messages.
//!
//! One assembler belongs to one channel. Streams are keyed by direction and
//! correlation id: request ids are chosen by the peer and response ids by us,
//! so the two spaces may overlap on the same connection.
//!
//! Bytes buffered across all open streams of a channel count against the
//! message size limit, and at most [`MAX_OPEN_STREAMS`] streams may be open
//! at once.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::frame::{flags, Frame, FrameError};
use crate::partition::PartitionId;

/// Fragment streams one channel may hold open at the same time.
pub const MAX_OPEN_STREAMS: usize = 64;

struct Partial {
    opcode: u8,
    partition_id: PartitionId,
    flags: u8,
    buf: BytesMut,
}

pub struct FragmentAssembler {
    partials: HashMap<(bool, u64), Partial>,
    /// Payload bytes held by all open streams.
    buffered: usize,
    max_message: usize,
}

impl FragmentAssembler {
    pub fn new(max_message: usize) -> Self {
        Self {
            partials: HashMap::new(),
            buffered: 0,
            max_message,
        }
    }

    /// Feed one decoded frame.
    ///
    /// Returns the complete message when `frame` is unfragmented or closes a
    /// fragment stream, `None` while a stream is still open. A protocol
    /// error discards the offending stream; the caller drops the frame and
    /// keeps the channel.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Frame>, FrameError> {
        frame.validate()?;

        if !frame.is_fragment() {
            if frame.is_final() {
                return Err(FrameError::FinalWithoutFragment);
            }
            return Ok(Some(frame));
        }

        let key = (frame.is_response(), frame.correlation_id);
        if self.partials.len() >= MAX_OPEN_STREAMS && !self.partials.contains_key(&key) {
            return Err(FrameError::TooManyStreams(MAX_OPEN_STREAMS));
        }
        let partial = self.partials.entry(key).or_insert_with(|| Partial {
            opcode: frame.opcode,
            partition_id: frame.partition_id,
            flags: frame.flags & !(flags::FRAGMENT | flags::FINAL),
            buf: BytesMut::new(),
        });

        if partial.opcode != frame.opcode || partial.partition_id != frame.partition_id {
            self.discard(&key);
            return Err(FrameError::FragmentMismatch(frame.correlation_id));
        }
        if self.buffered + frame.payload.len() > self.max_message {
            self.discard(&key);
            return Err(FrameError::MessageTooLarge {
                correlation_id: frame.correlation_id,
                max: self.max_message,
            });
        }
        partial.buf.put_slice(&frame.payload);
        self.buffered += frame.payload.len();

        if !frame.is_final() {
            return Ok(None);
        }

        // Present: inserted or found above.
        let Some(done) = self.partials.remove(&key) else {
            return Ok(None);
        };
        self.buffered -= done.buf.len();
        Ok(Some(Frame {
            opcode: done.opcode,
            correlation_id: frame.correlation_id,
            partition_id: done.partition_id,
            flags: done.flags,
            payload: done.buf.freeze(),
        }))
    }

    /// Streams opened but not yet closed by a final fragment.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Payload bytes held by open streams.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Discard every open stream. Called when the channel closes.
    pub fn clear(&mut self) {
        self.partials.clear();
        self.buffered = 0;
    }

    fn discard(&mut self, key: &(bool, u64)) {
        if let Some(partial) = self.partials.remove(key) {
            self.buffered -= partial.buf.len();
        }
    }
}
