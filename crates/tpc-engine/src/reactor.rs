//! Reactor: one OS thread, one I/O driver, the channels it owns.
//!
//! Every channel, operation and partition table of a reactor is touched by
//! its thread only. Other threads reach it exclusively through its
//! [`TaskQueue`]. One loop iteration:
//!
//! 1. push queued submissions; if no completion is ready, arm the wakeup
//!    flag and block in the driver until one is,
//! 2. handle up to `completion_batch` completions,
//! 3. run every queued task.
//!
//! A panic inside one completion or task handler is logged and the loop
//! goes on. A driver error ends the thread; the exit guard then fails all
//! invocations routed through this reactor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tpc_core::address::Address;
use tpc_core::error::{ErrorCode, RemoteError, Result, TpcError};
use tpc_core::frame::{Frame, FrameCodec};
use tpc_core::io_driver::{IoCompletion, IoDriver, IoOp};
use tpc_core::partition::hash_to_index;
use tpc_core::wakeup::WakeupSignal;
use tpc_module::socket::{self, SockAddr};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelKey, ChannelSlab, ChannelState};
use crate::config::SchedulingMode;
use crate::dispatcher::Dispatcher;
use crate::engine::{EngineShared, Request};
use crate::ops::is_fire_and_forget;
use crate::pool::PeerLink;
use crate::task_queue::TaskQueue;

/// Work handed to a reactor by other threads (or by itself).
pub(crate) enum Task {
    /// Execute a request for a locally owned partition. `None` for
    /// fire-and-forget requests.
    Local {
        request: Request,
        correlation_id: Option<u64>,
    },
    /// Make sure the link has a channel.
    Connect(Arc<PeerLink>),
    /// Encoded request frames for the link's channel.
    Write {
        link: Arc<PeerLink>,
        bytes: Bytes,
        correlation_id: Option<u64>,
    },
    /// Inbound request whose partition belongs to this reactor, received by
    /// another one.
    Forward { frame: Frame, reply_to: ChannelKey },
    /// Encoded response for one of this reactor's channels.
    Reply { channel: ChannelKey, bytes: Bytes },
    Stop,
}

/// Token layout: `kind:8 | aux:8 | generation:16 | slot:32`.
mod token {
    pub const WAKEUP: u8 = 1;
    pub const ACCEPT: u8 = 2;
    pub const DRAIN_TIMER: u8 = 3;
    pub const RECV: u8 = 4;
    pub const SEND: u8 = 5;
    pub const CONNECT: u8 = 6;
    pub const CONNECT_TIMEOUT: u8 = 7;
    pub const RETRY_TIMER: u8 = 8;

    #[inline]
    pub fn pack(kind: u8, aux: u8, generation: u16, slot: u32) -> u64 {
        (kind as u64) << 56 | (aux as u64) << 48 | (generation as u64) << 32 | slot as u64
    }

    #[inline]
    pub fn unpack(token: u64) -> (u8, u8, u16, u32) {
        (
            (token >> 56) as u8,
            (token >> 48) as u8,
            (token >> 32) as u16,
            token as u32,
        )
    }

    /// Kinds that belong to a channel slot.
    #[inline]
    pub fn is_channel(kind: u8) -> bool {
        (RECV..=RETRY_TIMER).contains(&kind)
    }
}

#[derive(Default)]
pub(crate) struct ReactorStats {
    accepted: AtomicU64,
    connects: AtomicU64,
    closed: AtomicU64,
    messages_in: AtomicU64,
    frames_out: AtomicU64,
    tasks: AtomicU64,
}

impl ReactorStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStatsSnapshot {
    pub accepted: u64,
    pub connects: u64,
    pub closed: u64,
    pub messages_in: u64,
    pub frames_out: u64,
    pub tasks: u64,
}

/// The part of a reactor other threads may touch.
pub struct ReactorShared {
    index: usize,
    pub(crate) queue: TaskQueue<Task>,
    alive: AtomicBool,
    pub(crate) stats: ReactorStats,
}

impl ReactorShared {
    pub(crate) fn new(index: usize, signal: Box<dyn WakeupSignal>, mode: SchedulingMode) -> Self {
        Self {
            index,
            queue: TaskQueue::new(signal, mode),
            alive: AtomicBool::new(true),
            stats: ReactorStats::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        if !self.is_alive() {
            return Err(TpcError::ReactorUnavailable(self.index));
        }
        self.queue.push(task);
        Ok(())
    }

    /// Queue a stop request and wake the reactor regardless of its flag.
    pub(crate) fn stop(&self) {
        self.queue.push(Task::Stop);
        if let Err(e) = self.queue.force_wakeup() {
            warn!(reactor = self.index, error = %e, "stop wakeup failed");
        }
    }

    pub fn stats(&self) -> ReactorStatsSnapshot {
        let s = &self.stats;
        ReactorStatsSnapshot {
            accepted: s.accepted.load(Ordering::Relaxed),
            connects: s.connects.load(Ordering::Relaxed),
            closed: s.closed.load(Ordering::Relaxed),
            messages_in: s.messages_in.load(Ordering::Relaxed),
            frames_out: s.frames_out.load(Ordering::Relaxed),
            tasks: s.tasks.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Reactor {
    index: usize,
    engine: Arc<EngineShared>,
    me: Arc<ReactorShared>,
    driver: Box<dyn IoDriver>,
    listener: RawFd,
    local: Address,
    codec: FrameCodec,
    dispatcher: Dispatcher,
    channels: ChannelSlab,
    /// Outbound channel per peer endpoint. Non-owning.
    outbound: HashMap<SocketAddr, (u32, u16)>,
    completions: Vec<IoCompletion>,
    wake_buf: Box<[u8; 8]>,
    wake_armed: bool,
    accept_armed: bool,
    stopping: bool,
    drain_expired: bool,
}

impl Reactor {
    pub(crate) fn new(
        index: usize,
        engine: Arc<EngineShared>,
        driver: Box<dyn IoDriver>,
        listener: RawFd,
        local: Address,
    ) -> Self {
        let me = engine.reactors[index].clone();
        let dispatcher = Dispatcher::new(
            engine.context.registry.clone(),
            engine.config.op_pool_capacity,
        );
        Self {
            index,
            codec: FrameCodec::new(engine.config.max_frame_payload),
            completions: Vec::with_capacity(engine.config.completion_batch),
            engine,
            me,
            driver,
            listener,
            local,
            dispatcher,
            channels: ChannelSlab::new(),
            outbound: HashMap::new(),
            wake_buf: Box::new([0u8; 8]),
            wake_armed: false,
            accept_armed: false,
            stopping: false,
            drain_expired: false,
        }
    }

    pub(crate) fn run(mut self) {
        self.me.queue.bind_owner();
        let spin = self.engine.config.scheduling == SchedulingMode::Spin;
        info!(driver = self.driver.name(), spin, "reactor started");

        self.arm_wakeup();
        self.arm_accept();

        loop {
            if let Err(e) = self.wait(spin) {
                error!(error = %e, "I/O driver failed, reactor exiting");
                break;
            }
            self.process_completions();
            self.run_tasks();
            if self.stopping && (self.quiescent() || self.drain_expired) {
                break;
            }
        }
        self.teardown();
    }

    fn wait(&mut self, spin: bool) -> Result<()> {
        // Always enter the driver: queued submissions only reach the kernel here.
        self.driver.submit_and_wait(0)?;
        if spin || self.driver.has_completions() || !self.me.queue.is_empty() {
            return Ok(());
        }
        if self.stopping && self.quiescent() {
            return Ok(());
        }
        if !self.me.queue.arm() {
            return Ok(());
        }
        let waited = self.driver.submit_and_wait(1);
        self.me.queue.disarm();
        waited.map(drop)
    }

    fn quiescent(&self) -> bool {
        self.channels.is_empty() && !self.accept_armed && !self.wake_armed
    }

    fn process_completions(&mut self) {
        let mut batch = std::mem::take(&mut self.completions);
        batch.clear();
        self.driver
            .drain(&mut batch, self.engine.config.completion_batch);
        for &c in &batch {
            if catch_unwind(AssertUnwindSafe(|| self.on_completion(c))).is_err() {
                error!(token = c.token, result = c.result, "completion handler panicked");
            }
        }
        self.completions = batch;
    }

    fn run_tasks(&mut self) {
        while let Some(task) = self.me.queue.pop() {
            ReactorStats::bump(&self.me.stats.tasks, 1);
            if catch_unwind(AssertUnwindSafe(|| self.on_task(task))).is_err() {
                error!("task panicked");
            }
        }
    }

    // ── Completions ──

    fn on_completion(&mut self, c: IoCompletion) {
        let (kind, aux, generation, slot) = token::unpack(c.token);
        match kind {
            token::WAKEUP => self.on_wakeup(c.result),
            token::ACCEPT => self.on_accept(c.result),
            token::DRAIN_TIMER => self.on_drain_timer(c.result),
            token::RECV => self.on_recv(slot, generation, c.result),
            token::SEND => self.on_send(slot, generation, c.result),
            token::CONNECT => self.on_connect(slot, generation, aux, c.result),
            token::CONNECT_TIMEOUT => self.on_connect_timeout(slot, generation, aux, c.result),
            token::RETRY_TIMER => self.on_retry_timer(slot, generation, c.result),
            _ => warn!(token = c.token, "completion with unknown token"),
        }
        if token::is_channel(kind) {
            self.release_if_done(slot, generation);
        }
    }

    fn arm_wakeup(&mut self) {
        let op = IoOp::Read {
            fd: self.me.queue.read_fd(),
            buf: self.wake_buf.as_mut_ptr(),
            len: 8,
        };
        // SAFETY: wake_buf is heap-allocated and outlives the read (see teardown).
        match unsafe { self.driver.submit(token::pack(token::WAKEUP, 0, 0, 0), op) } {
            Ok(()) => self.wake_armed = true,
            Err(e) => error!(error = %e, "cannot arm wakeup read"),
        }
    }

    fn on_wakeup(&mut self, result: i32) {
        self.wake_armed = false;
        if result < 0 && result != -libc::ECANCELED && result != -libc::EAGAIN {
            warn!(error = %TpcError::from_errno("wakeup read", result), "wakeup read failed");
        }
        if !self.stopping {
            self.arm_wakeup();
        }
    }

    fn arm_accept(&mut self) {
        if self.listener < 0 || self.accept_armed || self.stopping {
            return;
        }
        let op = IoOp::Accept { fd: self.listener };
        match unsafe { self.driver.submit(token::pack(token::ACCEPT, 0, 0, 0), op) } {
            Ok(()) => self.accept_armed = true,
            Err(e) => error!(error = %e, "cannot arm accept"),
        }
    }

    fn on_accept(&mut self, result: i32) {
        self.accept_armed = false;
        if result >= 0 {
            if self.stopping {
                socket::close(result);
                return;
            }
            self.adopt(result);
        } else if result != -libc::ECANCELED {
            warn!(error = %TpcError::from_errno("accept", result), "accept failed");
        }
        self.arm_accept();
    }

    fn adopt(&mut self, fd: RawFd) {
        let remote = match socket::peer_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(error = %e, "accepted socket already gone");
                socket::close(fd);
                return;
            }
        };
        if let Err(e) = socket::apply_options(fd, &self.engine.config.socket) {
            debug!(%remote, error = %e, "socket options not applied");
        }
        let local = socket::local_addr(fd).ok();
        let channel = Channel::accepted(fd, remote, local, self.engine.config.max_message_size);
        let (slot, generation) = self.channels.alloc(channel);
        ReactorStats::bump(&self.me.stats.accepted, 1);
        debug!(%remote, slot, "accepted channel");
        self.post_recv(slot, generation);
    }

    fn post_recv(&mut self, slot: u32, generation: u16) {
        let min = self.engine.config.read_buffer_size;
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        if ch.state != ChannelState::Open || ch.recv_in_flight {
            return;
        }
        let (buf, len) = ch.recv_target(min);
        let op = IoOp::Recv { fd: ch.fd, buf, len };
        // SAFETY: the read buffer is not touched until the completion, and
        // the channel stays in the slab while the receive is in flight.
        match unsafe { self.driver.submit(token::pack(token::RECV, 0, generation, slot), op) } {
            Ok(()) => ch.recv_in_flight = true,
            Err(e) => self.close(slot, generation, e),
        }
    }

    fn on_recv(&mut self, slot: u32, generation: u16, result: i32) {
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        ch.recv_in_flight = false;
        if ch.state != ChannelState::Open {
            return;
        }
        if result <= 0 {
            let cause = if result == 0 {
                TpcError::Transport(format!("{} closed the connection", ch.remote_addr))
            } else {
                TpcError::from_errno("recv", result)
            };
            self.close(slot, generation, cause);
            return;
        }
        // SAFETY: the kernel wrote `result` bytes into the spare capacity
        // handed out by `recv_target`.
        unsafe { ch.received(result as usize) };
        self.drain_frames(slot, generation);
        self.post_recv(slot, generation);
    }

    fn drain_frames(&mut self, slot: u32, generation: u16) {
        loop {
            let Some(ch) = self.channels.get_mut(slot, generation) else {
                return;
            };
            if ch.state != ChannelState::Open {
                return;
            }
            match ch.next_message(&self.codec) {
                Ok(Some(frame)) => {
                    ReactorStats::bump(&self.me.stats.messages_in, 1);
                    self.on_frame(slot, generation, frame);
                }
                Ok(None) => return,
                Err(e) if e.corrupts_stream() => {
                    warn!(remote = %ch.remote_addr, error = %e, "framing lost, closing channel");
                    self.close(slot, generation, e.into());
                    return;
                }
                Err(e) => {
                    warn!(remote = %ch.remote_addr, error = %e, "dropping malformed frame");
                }
            }
        }
    }

    fn on_frame(&mut self, slot: u32, generation: u16, frame: Frame) {
        if frame.is_response() {
            self.on_response(slot, generation, frame);
        } else {
            self.on_request(slot, generation, frame);
        }
    }

    fn on_response(&mut self, slot: u32, generation: u16, frame: Frame) {
        let correlation_id = frame.correlation_id;
        let peer = self
            .channels
            .get(slot, generation)
            .and_then(|ch| ch.link.as_ref())
            .map(|link| link.peer());
        let Some(peer) = peer else {
            warn!(correlation_id, "response on an inbound channel, dropping");
            return;
        };
        if self.engine.is_shutting_down() {
            debug!(%peer, correlation_id, "shutting down, dropping response");
            return;
        }
        if !self
            .engine
            .invocations
            .complete(&peer, correlation_id, frame.into_result())
        {
            warn!(%peer, correlation_id, "no pending invocation, dropping response");
        }
    }

    fn on_request(&mut self, slot: u32, generation: u16, frame: Frame) {
        let owner = hash_to_index(frame.partition_id, self.engine.reactors.len());
        if owner == self.index {
            if let Some(bytes) = self.execute(frame) {
                self.write(slot, generation, bytes);
            }
            return;
        }

        let (opcode, correlation_id, partition_id) =
            (frame.opcode, frame.correlation_id, frame.partition_id);
        let reply_to = ChannelKey {
            reactor: self.index,
            slot,
            generation,
        };
        trace!(partition_id, owner, "forwarding request");
        if let Err(e) = self.engine.reactors[owner].submit(Task::Forward { frame, reply_to }) {
            if !is_fire_and_forget(opcode) {
                let err = RemoteError::new(ErrorCode::OperationFailed, e.to_string());
                let bytes = self.encode_response(opcode, correlation_id, partition_id, Err(err));
                self.write(slot, generation, bytes);
            }
        }
    }

    /// Run an inbound request; the encoded response, if any.
    fn execute(&mut self, frame: Frame) -> Option<Bytes> {
        let Frame {
            opcode,
            correlation_id,
            partition_id,
            payload,
            ..
        } = frame;
        let result = self
            .dispatcher
            .dispatch(opcode, partition_id, correlation_id, payload)?;
        Some(self.encode_response(opcode, correlation_id, partition_id, result))
    }

    fn encode_response(
        &self,
        opcode: u8,
        correlation_id: u64,
        partition_id: i32,
        result: std::result::Result<Bytes, RemoteError>,
    ) -> Bytes {
        let frame = Frame::response(opcode, correlation_id, partition_id, result);
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        let frames = self
            .codec
            .encode_message(&frame, self.engine.config.fragment_threshold, &mut buf);
        ReactorStats::bump(&self.me.stats.frames_out, frames as u64);
        buf.freeze()
    }

    fn write(&mut self, slot: u32, generation: u16, bytes: Bytes) {
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            trace!(slot, "write for a closed channel dropped");
            return;
        };
        if matches!(ch.state, ChannelState::Closing | ChannelState::Closed) {
            return;
        }
        ch.writes.push(bytes);
        self.flush(slot, generation);
    }

    fn flush(&mut self, slot: u32, generation: u16) {
        let coalesce = self.engine.config.write_coalesce_bytes;
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        if ch.state != ChannelState::Open {
            return;
        }
        let Some((buf, len)) = ch.writes.next_send(coalesce) else {
            return;
        };
        let op = IoOp::Send { fd: ch.fd, buf, len };
        // SAFETY: the front chunk is not dropped or advanced until the send
        // completes.
        if let Err(e) = unsafe { self.driver.submit(token::pack(token::SEND, 0, generation, slot), op) } {
            ch.writes.abort_send();
            self.close(slot, generation, e);
        }
    }

    fn on_send(&mut self, slot: u32, generation: u16, result: i32) {
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        if result < 0 {
            ch.writes.abort_send();
            self.close(slot, generation, TpcError::from_errno("send", result));
            return;
        }
        ch.writes.consume(result as usize);
        self.flush(slot, generation);
    }

    // ── Outbound connections ──

    /// The channel serving `link`, creating and connecting one if needed.
    fn outbound_channel(&mut self, link: &Arc<PeerLink>) -> Option<(u32, u16)> {
        if let Some(&(slot, generation)) = self.outbound.get(&link.endpoint()) {
            let usable = self
                .channels
                .get(slot, generation)
                .is_some_and(|ch| matches!(ch.state, ChannelState::Connecting | ChannelState::Open));
            if usable {
                return Some((slot, generation));
            }
        }

        let channel = Channel::outbound(link.clone(), self.engine.config.max_message_size);
        let (slot, generation) = self.channels.alloc(channel);
        self.outbound.insert(link.endpoint(), (slot, generation));
        link.connect_started();
        ReactorStats::bump(&self.me.stats.connects, 1);
        debug!(peer = %link.peer(), endpoint = %link.endpoint(), "connecting");

        self.start_connect(slot, generation);
        self.channels
            .get(slot, generation)
            .filter(|ch| ch.state == ChannelState::Connecting)
            .map(|_| (slot, generation))
    }

    fn start_connect(&mut self, slot: u32, generation: u16) {
        let timeout = self.engine.config.connect_timeout;
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        ch.attempt += 1;
        ch.timed_out = false;
        let endpoint = ch.remote_addr;

        let fd = match socket::stream_socket(&endpoint) {
            Ok(fd) => fd,
            Err(e) => {
                self.connect_failed(slot, generation, e.to_string());
                return;
            }
        };
        if let Err(e) = socket::apply_options(fd, &self.engine.config.socket) {
            debug!(%endpoint, error = %e, "socket options not applied");
        }
        ch.fd = fd;
        let sa = ch.sockaddr.insert(Box::new(SockAddr::from(endpoint)));
        let op = IoOp::Connect {
            fd,
            addr: sa.as_ptr(),
            addr_len: sa.len(),
        };
        let aux = ch.attempt as u8;

        // SAFETY: the boxed sockaddr lives in the channel until it is
        // released, which waits for this completion.
        if let Err(e) = unsafe { self.driver.submit(token::pack(token::CONNECT, aux, generation, slot), op) } {
            socket::close(fd);
            ch.fd = -1;
            self.connect_failed(slot, generation, e.to_string());
            return;
        }
        ch.connect_in_flight = true;

        let timer = IoOp::Timeout { after: timeout };
        match unsafe { self.driver.submit(token::pack(token::CONNECT_TIMEOUT, aux, generation, slot), timer) } {
            Ok(()) => ch.timers += 1,
            Err(e) => warn!(%endpoint, error = %e, "connect timeout not armed"),
        }
    }

    fn on_connect(&mut self, slot: u32, generation: u16, aux: u8, result: i32) {
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        ch.connect_in_flight = false;
        if ch.state != ChannelState::Connecting {
            return;
        }
        if ch.timers > 0 {
            let _ = self
                .driver
                .cancel(token::pack(token::CONNECT_TIMEOUT, aux, generation, slot));
        }

        if result == 0 {
            ch.state = ChannelState::Open;
            ch.local_addr = socket::local_addr(ch.fd).ok();
            if let Some(link) = &ch.link {
                link.mark_open();
                info!(peer = %link.peer(), endpoint = %ch.remote_addr, attempt = ch.attempt, "connected");
            }
            self.post_recv(slot, generation);
            self.flush(slot, generation);
            return;
        }

        let reason = if ch.timed_out {
            format!("timed out after {:?}", self.engine.config.connect_timeout)
        } else {
            TpcError::from_errno("connect", result).to_string()
        };
        socket::close(ch.fd);
        ch.fd = -1;
        self.connect_failed(slot, generation, reason);
    }

    /// One attempt failed: schedule the next one or give up.
    fn connect_failed(&mut self, slot: u32, generation: u16, reason: String) {
        let retries = self.engine.config.connect_retries;
        let backoff = self.engine.config.connect_backoff;
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        let addr = ch.remote_addr;

        if ch.attempt <= retries && !self.stopping {
            let delay = backoff * ch.attempt;
            debug!(endpoint = %addr, attempt = ch.attempt, %reason, ?delay, "connect failed, retrying");
            let timer = IoOp::Timeout { after: delay };
            let tok = token::pack(token::RETRY_TIMER, ch.attempt as u8, generation, slot);
            match unsafe { self.driver.submit(tok, timer) } {
                Ok(()) => {
                    ch.timers += 1;
                    return;
                }
                Err(e) => warn!(endpoint = %addr, error = %e, "retry timer not armed"),
            }
        }

        warn!(endpoint = %addr, attempts = ch.attempt, %reason, "connect failed");
        self.close(slot, generation, TpcError::Connect { addr, reason });
    }

    fn on_connect_timeout(&mut self, slot: u32, generation: u16, aux: u8, result: i32) {
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        ch.timers = ch.timers.saturating_sub(1);
        let current = aux == ch.attempt as u8;
        if result != 0 || !current || ch.state != ChannelState::Connecting || !ch.connect_in_flight {
            return;
        }
        ch.timed_out = true;
        let _ = self
            .driver
            .cancel(token::pack(token::CONNECT, aux, generation, slot));
    }

    fn on_retry_timer(&mut self, slot: u32, generation: u16, result: i32) {
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        ch.timers = ch.timers.saturating_sub(1);
        if result != 0 || ch.state != ChannelState::Connecting {
            return;
        }
        self.start_connect(slot, generation);
    }

    // ── Teardown ──

    /// Shut the socket and cancel what is in flight. The slot is released
    /// by `release_if_done` once the last completion has arrived.
    fn close(&mut self, slot: u32, generation: u16, cause: TpcError) {
        let Some(ch) = self.channels.get_mut(slot, generation) else {
            return;
        };
        if matches!(ch.state, ChannelState::Closing | ChannelState::Closed) {
            return;
        }
        ch.state = ChannelState::Closing;
        if ch.fd >= 0 {
            socket::shutdown(ch.fd);
        }
        ch.assembler.clear();

        let aux = ch.attempt as u8;
        let mut cancels = Vec::with_capacity(4);
        if ch.recv_in_flight {
            cancels.push(token::pack(token::RECV, 0, generation, slot));
        }
        if ch.writes.in_flight() {
            cancels.push(token::pack(token::SEND, 0, generation, slot));
        }
        if ch.connect_in_flight {
            cancels.push(token::pack(token::CONNECT, aux, generation, slot));
        }
        if ch.timers > 0 {
            cancels.push(token::pack(token::CONNECT_TIMEOUT, aux, generation, slot));
            cancels.push(token::pack(token::RETRY_TIMER, aux, generation, slot));
        }
        let link = ch.link.clone();
        let remote = ch.remote_addr;

        for tok in cancels {
            let _ = self.driver.cancel(tok);
        }
        ReactorStats::bump(&self.me.stats.closed, 1);

        match link {
            Some(link) => {
                if self.outbound.get(&link.endpoint()) == Some(&(slot, generation)) {
                    self.outbound.remove(&link.endpoint());
                }
                let failed = self
                    .engine
                    .invocations
                    .fail_routed(&link.peer(), link.index(), &cause);
                link.reset();
                info!(peer = %link.peer(), endpoint = %remote, failed, cause = %cause, "outbound channel closed");
            }
            None => debug!(%remote, cause = %cause, "channel closed"),
        }
        self.release_if_done(slot, generation);
    }

    fn release_if_done(&mut self, slot: u32, generation: u16) {
        let done = self
            .channels
            .get(slot, generation)
            .is_some_and(|ch| ch.state == ChannelState::Closing && ch.ops_in_flight() == 0);
        if !done {
            return;
        }
        if let Some(mut ch) = self.channels.remove(slot) {
            socket::close(ch.fd);
            ch.state = ChannelState::Closed;
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        info!(channels = self.channels.len(), "reactor stopping");

        for (slot, generation) in self.channels.keys() {
            self.close(slot, generation, TpcError::ShuttingDown);
        }
        if self.accept_armed {
            let _ = self.driver.cancel(token::pack(token::ACCEPT, 0, 0, 0));
        }
        if self.wake_armed {
            let _ = self.driver.cancel(token::pack(token::WAKEUP, 0, 0, 0));
        }
        let deadline = IoOp::Timeout {
            after: self.engine.config.termination_timeout,
        };
        if let Err(e) = unsafe { self.driver.submit(token::pack(token::DRAIN_TIMER, 0, 0, 0), deadline) } {
            warn!(error = %e, "drain timer not armed");
            self.drain_expired = true;
        }
    }

    fn on_drain_timer(&mut self, result: i32) {
        if result == 0 && !self.quiescent() {
            warn!(channels = self.channels.len(), "drain deadline passed, abandoning in-flight operations");
            self.drain_expired = true;
        }
    }

    fn teardown(mut self) {
        if self.listener >= 0 {
            socket::close(self.listener);
            self.listener = -1;
        }
        let mut leaked = 0;
        for (slot, _) in self.channels.keys() {
            if let Some(ch) = self.channels.remove(slot) {
                socket::close(ch.fd);
                if ch.ops_in_flight() > 0 {
                    // The kernel may still write into these buffers.
                    std::mem::forget(ch);
                    leaked += 1;
                }
            }
        }
        if self.wake_armed {
            std::mem::forget(std::mem::replace(&mut self.wake_buf, Box::new([0u8; 8])));
        }
        let stats = self.me.stats();
        info!(
            leaked,
            accepted = stats.accepted,
            messages_in = stats.messages_in,
            frames_out = stats.frames_out,
            "reactor stopped"
        );
    }

    // ── Tasks ──

    fn on_task(&mut self, task: Task) {
        if self.stopping {
            self.reject(task);
            return;
        }
        match task {
            Task::Local {
                request,
                correlation_id,
            } => self.run_local(request, correlation_id),
            Task::Connect(link) => {
                self.outbound_channel(&link);
            }
            Task::Write {
                link,
                bytes,
                correlation_id,
            } => {
                if let Some((slot, generation)) = self.outbound_channel(&link) {
                    trace!(peer = %link.peer(), correlation_id, len = bytes.len(), "request queued");
                    self.write(slot, generation, bytes);
                }
            }
            Task::Forward { frame, reply_to } => self.run_forwarded(frame, reply_to),
            Task::Reply { channel, bytes } => {
                debug_assert_eq!(channel.reactor, self.index);
                self.write(channel.slot, channel.generation, bytes);
            }
            Task::Stop => self.begin_stop(),
        }
    }

    /// Tasks arriving after stop. Invocations were already failed by the
    /// engine; this only catches ones that raced with it.
    fn reject(&mut self, task: Task) {
        let (peer, correlation_id) = match task {
            Task::Local {
                correlation_id: Some(id),
                ..
            } => (self.local, id),
            Task::Write {
                link,
                correlation_id: Some(id),
                ..
            } => (link.peer(), id),
            _ => return,
        };
        self.engine
            .invocations
            .fail(&peer, correlation_id, TpcError::ShuttingDown);
    }

    fn run_local(&mut self, request: Request, correlation_id: Option<u64>) {
        let result = self.dispatcher.dispatch(
            request.opcode,
            request.partition_id,
            correlation_id.unwrap_or(0),
            request.payload,
        );
        let Some(id) = correlation_id else {
            return;
        };
        let result = match result {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(e)) => Err(TpcError::from(e)),
            None => Ok(Bytes::new()),
        };
        if !self.engine.invocations.complete(&self.local, id, result) {
            debug!(correlation_id = id, "local invocation already completed");
        }
    }

    fn run_forwarded(&mut self, frame: Frame, reply_to: ChannelKey) {
        let Some(bytes) = self.execute(frame) else {
            return;
        };
        if reply_to.reactor == self.index {
            self.write(reply_to.slot, reply_to.generation, bytes);
            return;
        }
        let Some(origin) = self.engine.reactors.get(reply_to.reactor) else {
            return;
        };
        if let Err(e) = origin.submit(Task::Reply {
            channel: reply_to,
            bytes,
        }) {
            debug!(error = %e, "origin reactor gone, dropping reply");
        }
    }
}
