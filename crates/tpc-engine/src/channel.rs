//! Channels: a nonblocking socket with its buffers, owned by one reactor.
//!
//! Nothing here performs I/O. The reactor submits reads into
//! [`Channel::recv_target`], sends from [`WriteQueue::next_send`], and feeds
//! completions back through [`Channel::received`] / [`WriteQueue::consume`].
//! Buffers referenced by an in-flight operation are never moved or freed;
//! the slab keeps a closed channel until its last completion has arrived.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tpc_core::fragment::FragmentAssembler;
use tpc_core::frame::{Frame, FrameCodec, FrameError};
use tpc_module::socket::SockAddr;

use crate::pool::PeerLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Cross-thread name of a channel: reactor, slot and slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub reactor: usize,
    pub slot: u32,
    pub generation: u16,
}

/// Ordered byte ranges waiting to be sent.
///
/// At most one send is in flight and it always covers (a prefix of) the
/// front chunk. A short send advances the front chunk; nothing is re-sent
/// or skipped.
#[derive(Debug, Default)]
pub struct WriteQueue {
    chunks: VecDeque<Bytes>,
    queued: usize,
    in_flight: bool,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.queued += bytes.len();
        self.chunks.push_back(bytes);
    }

    /// Pointer and length for the next send, or `None` if a send is already
    /// in flight or nothing is queued.
    ///
    /// Leading chunks smaller than `coalesce` are first merged into one.
    /// The returned memory stays valid until [`consume`](Self::consume).
    pub fn next_send(&mut self, coalesce: usize) -> Option<(*const u8, u32)> {
        if self.in_flight {
            return None;
        }
        self.coalesce(coalesce);
        let front = self.chunks.front()?;
        let len = front.len().min(i32::MAX as usize) as u32;
        self.in_flight = true;
        Some((front.as_ptr(), len))
    }

    fn coalesce(&mut self, limit: usize) {
        let small = |b: &Bytes| b.len() < limit;
        if self.chunks.len() < 2 || !self.chunks.front().is_some_and(small) {
            return;
        }
        let mut merged = BytesMut::with_capacity(limit);
        while let Some(front) = self.chunks.front() {
            if !merged.is_empty() && merged.len() + front.len() > limit {
                break;
            }
            merged.extend_from_slice(front);
            self.chunks.pop_front();
        }
        self.chunks.push_front(merged.freeze());
    }

    /// Account for a completed send of `n` bytes.
    pub fn consume(&mut self, n: usize) {
        self.in_flight = false;
        let Some(front) = self.chunks.front_mut() else {
            return;
        };
        let n = n.min(front.len());
        front.advance(n);
        self.queued -= n;
        if front.is_empty() {
            self.chunks.pop_front();
        }
    }

    /// A send failed; the front chunk stays as it was.
    pub fn abort_send(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Bytes waiting, including the part covered by the in-flight send.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.queued = 0;
    }
}

pub struct Channel {
    pub fd: RawFd,
    pub state: ChannelState,
    pub remote_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    /// Set for outbound channels.
    pub link: Option<Arc<PeerLink>>,
    pub read_buf: BytesMut,
    pub assembler: FragmentAssembler,
    pub writes: WriteQueue,
    pub recv_in_flight: bool,
    pub connect_in_flight: bool,
    /// Connect-timeout and retry timers pending.
    pub timers: u8,
    /// Connect attempt number, starting at 1.
    pub attempt: u32,
    /// Connect target; must outlive the in-flight connect.
    pub sockaddr: Option<Box<SockAddr>>,
    /// Set when the connect-timeout timer cancelled the attempt.
    pub timed_out: bool,
}

impl Channel {
    pub fn accepted(fd: RawFd, remote_addr: SocketAddr, local_addr: Option<SocketAddr>, max_message: usize) -> Self {
        Self::new(fd, ChannelState::Open, remote_addr, local_addr, None, max_message)
    }

    pub fn outbound(link: Arc<PeerLink>, max_message: usize) -> Self {
        let remote = link.endpoint();
        Self::new(-1, ChannelState::Connecting, remote, None, Some(link), max_message)
    }

    fn new(
        fd: RawFd,
        state: ChannelState,
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        link: Option<Arc<PeerLink>>,
        max_message: usize,
    ) -> Self {
        Self {
            fd,
            state,
            remote_addr,
            local_addr,
            link,
            read_buf: BytesMut::new(),
            assembler: FragmentAssembler::new(max_message),
            writes: WriteQueue::new(),
            recv_in_flight: false,
            connect_in_flight: false,
            timers: 0,
            attempt: 0,
            sockaddr: None,
            timed_out: false,
        }
    }

    pub fn is_outbound(&self) -> bool {
        self.link.is_some()
    }

    /// Operations whose completion is still outstanding.
    pub fn ops_in_flight(&self) -> usize {
        usize::from(self.recv_in_flight)
            + usize::from(self.writes.in_flight())
            + usize::from(self.connect_in_flight)
            + usize::from(self.timers)
    }

    /// Spare capacity of the read buffer for the next receive, grown to at
    /// least `min` bytes.
    pub fn recv_target(&mut self, min: usize) -> (*mut u8, u32) {
        if self.read_buf.capacity() - self.read_buf.len() < min {
            self.read_buf.reserve(min);
        }
        let spare = self.read_buf.spare_capacity_mut();
        let len = spare.len().min(u32::MAX as usize) as u32;
        (spare.as_mut_ptr().cast(), len)
    }

    /// Commit `n` bytes written by the kernel into the spare capacity.
    ///
    /// # Safety
    ///
    /// `n` must not exceed the length returned by the matching
    /// `recv_target`, and the buffer must not have been touched since.
    pub unsafe fn received(&mut self, n: usize) {
        let len = self.read_buf.len();
        self.read_buf.set_len(len + n);
    }

    /// Next complete message from the read buffer.
    ///
    /// Fragments are reassembled. An error that
    /// [corrupts the stream](FrameError::corrupts_stream) means the channel
    /// has to go; any other error concerns only the frame just decoded.
    pub fn next_message(&mut self, codec: &FrameCodec) -> Result<Option<Frame>, FrameError> {
        while let Some(frame) = codec.decode(&mut self.read_buf)? {
            if let Some(message) = self.assembler.accept(frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

/// Generation-checked channel storage of one reactor.
///
/// A slot index is reused after `free`, with a bumped generation, so a late
/// completion or a stale [`ChannelKey`] never reaches the new occupant.
#[derive(Default)]
pub struct ChannelSlab {
    slots: Vec<Option<Channel>>,
    generations: Vec<u16>,
    free: Vec<u32>,
}

impl ChannelSlab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, channel: Channel) -> (u32, u16) {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                (self.slots.len() - 1) as u32
            }
        };
        self.slots[slot as usize] = Some(channel);
        (slot, self.generations[slot as usize])
    }

    pub fn get(&self, slot: u32, generation: u16) -> Option<&Channel> {
        if *self.generations.get(slot as usize)? != generation {
            return None;
        }
        self.slots[slot as usize].as_ref()
    }

    pub fn get_mut(&mut self, slot: u32, generation: u16) -> Option<&mut Channel> {
        if *self.generations.get(slot as usize)? != generation {
            return None;
        }
        self.slots[slot as usize].as_mut()
    }

    pub fn remove(&mut self, slot: u32) -> Option<Channel> {
        let channel = self.slots.get_mut(slot as usize)?.take()?;
        let generation = &mut self.generations[slot as usize];
        *generation = generation.wrapping_add(1);
        self.free.push(slot);
        Some(channel)
    }

    /// `(slot, generation)` of every live channel.
    pub fn keys(&self) -> Vec<(u32, u16)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| (i as u32, self.generations[i]))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
