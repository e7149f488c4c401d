//! The engine: reactor lifecycle and invocation routing.
//!
//! ```text
//!   caller thread                         reactor i (thread tpc-reactor-i)
//!   ─────────────                         ───────────────────────────────
//!   invoke(req)
//!     owner == local ──► Task::Local ───► dispatcher ──► complete future
//!     owner == peer  ──► Task::Write ───► channel i to peer.port + i
//!                                            ... response frame ...
//!                                         invocation table ──► complete future
//! ```
//!
//! `invoke` never blocks and never returns an error directly: every failure,
//! including the ones detected before anything is queued, is delivered
//! through the returned [`InvocationFuture`].

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tpc_core::address::Address;
use tpc_core::error::{ErrorCode, RemoteError, Result, TpcError};
use tpc_core::frame::{Frame, FrameCodec};
use tpc_core::io_driver::IoDriver;
use tpc_core::partition::{hash_to_index, PartitionId};
use tpc_module::{affinity, socket};
use tracing::{debug, info, info_span, warn};

use crate::channel::ChannelKey;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::future::InvocationFuture;
use crate::invocation::InvocationTable;
use crate::ops::{is_fire_and_forget, Opcode};
use crate::pool::PeerPool;
use crate::reactor::{Reactor, ReactorShared, ReactorStatsSnapshot, Task};

/// One call into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: u8,
    pub partition_id: PartitionId,
    pub payload: Bytes,
}

impl Request {
    pub fn new(opcode: Opcode, partition_id: PartitionId, payload: impl Into<Bytes>) -> Self {
        Self::raw(opcode as u8, partition_id, payload)
    }

    /// Request with an arbitrary opcode byte, registered or not.
    pub fn raw(opcode: u8, partition_id: PartitionId, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            partition_id,
            payload: payload.into(),
        }
    }
}

/// State shared by the engine handle and every reactor thread.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) context: EngineContext,
    pub(crate) reactors: Vec<Arc<ReactorShared>>,
    pub(crate) invocations: InvocationTable,
    pub(crate) links: PeerPool,
    codec: FrameCodec,
    started: AtomicBool,
    shutting_down: AtomicBool,
    local_address: OnceLock<Address>,
    /// Reactor threads that have not exited yet.
    live: Mutex<usize>,
    terminated: Condvar,
}

impl EngineShared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Answer a forwarded request whose owning reactor died before running it.
    fn refuse_forward(&self, index: usize, frame: Frame, reply_to: ChannelKey) {
        if is_fire_and_forget(frame.opcode) {
            return;
        }
        let correlation_id = frame.correlation_id;
        let err = RemoteError::new(
            ErrorCode::OperationFailed,
            TpcError::ReactorUnavailable(index).to_string(),
        );
        let response = Frame::response(frame.opcode, correlation_id, frame.partition_id, Err(err));
        let mut buf = BytesMut::with_capacity(response.encoded_len());
        self.codec
            .encode_message(&response, self.config.fragment_threshold, &mut buf);
        let sent = match self.reactors.get(reply_to.reactor) {
            Some(origin) => origin.submit(Task::Reply {
                channel: reply_to,
                bytes: buf.freeze(),
            }),
            None => Err(TpcError::ReactorUnavailable(reply_to.reactor)),
        };
        if let Err(e) = sent {
            warn!(reactor = index, correlation_id, error = %e, "forwarded request lost");
        }
    }

    fn reactor_exited(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.terminated.notify_all();
        }
    }
}

/// Runs when a reactor thread ends, whether it returned or unwound.
struct ExitGuard {
    engine: Arc<EngineShared>,
    index: usize,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let reactor = &self.engine.reactors[self.index];
        reactor.mark_dead();
        let mut dropped = 0usize;
        while let Some(task) = reactor.queue.pop() {
            dropped += 1;
            if let Task::Forward { frame, reply_to } = task {
                self.engine.refuse_forward(self.index, frame, reply_to);
            }
        }
        let err = if self.engine.is_shutting_down() {
            TpcError::ShuttingDown
        } else {
            TpcError::ReactorUnavailable(self.index)
        };
        let failed = self.engine.invocations.fail_reactor(self.index, &err);
        if failed > 0 || dropped > 0 || !self.engine.is_shutting_down() {
            warn!(reactor = self.index, failed, dropped, "reactor exited");
        }
        self.engine.reactor_exited();
    }
}

pub struct Engine {
    shared: Arc<EngineShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, context: EngineContext) -> Result<Self> {
        config.validate()?;
        context.registry.ensure_complete(&Opcode::ALL)?;

        let reactors = (0..config.reactor_count)
            .map(|i| {
                let signal = tpc_module::new_signal()?;
                Ok(Arc::new(ReactorShared::new(i, signal, config.scheduling)))
            })
            .collect::<Result<Vec<_>>>()?;

        let shared = EngineShared {
            codec: FrameCodec::new(config.max_frame_payload),
            links: PeerPool::new(config.reactor_count),
            invocations: InvocationTable::new(),
            reactors,
            config,
            context,
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            local_address: OnceLock::new(),
            live: Mutex::new(0),
            terminated: Condvar::new(),
        };
        Ok(Self {
            shared: Arc::new(shared),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listeners and spawn one thread per reactor.
    ///
    /// A failed bind or driver setup leaves the engine unstarted; `start`
    /// may be called again.
    pub fn start(&self) -> Result<()> {
        let cfg = &self.shared.config;
        self.start_with(|_| tpc_module::new_driver(cfg.driver, cfg.ring_entries))
    }

    pub(crate) fn start_with<F>(&self, make_driver: F) -> Result<()>
    where
        F: FnMut(usize) -> Result<Box<dyn IoDriver>>,
    {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(TpcError::ShuttingDown);
        }
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(TpcError::Config("engine already started".into()));
        }
        let (base, listeners, drivers) = match self.prepare(make_driver) {
            Ok(parts) => parts,
            Err(e) => {
                shared.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let count = drivers.len();
        let local = Address::new(shared.config.bind_host, base);
        let _ = shared.local_address.set(local);
        *shared.live.lock() = count;
        info!(
            %local,
            reactors = count,
            driver = drivers.first().map_or("none", |d| d.name()),
            "engine starting"
        );

        let mut threads = self.threads.lock();
        for (index, (driver, listener)) in drivers.into_iter().zip(listeners).enumerate() {
            let engine = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("tpc-reactor-{index}"))
                .spawn(move || reactor_main(engine, index, driver, listener, local));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    socket::close(listener);
                    shared.reactors[index].mark_dead();
                    shared.reactor_exited();
                    warn!(reactor = index, error = %e, "cannot spawn reactor thread");
                }
            }
        }
        Ok(())
    }

    /// Listening sockets and one driver per reactor.
    fn prepare<F>(&self, mut make_driver: F) -> Result<(u16, Vec<RawFd>, Vec<Box<dyn IoDriver>>)>
    where
        F: FnMut(usize) -> Result<Box<dyn IoDriver>>,
    {
        let cfg = &self.shared.config;
        let count = cfg.reactor_count;
        let (base, listeners) = socket::listen_group(
            cfg.bind_host,
            cfg.port_start,
            cfg.port_end,
            count,
            cfg.listen_backlog,
        )
        .map_err(|e| {
            TpcError::Bind(format!(
                "{} ports in {}..={} on {}: {e}",
                count, cfg.port_start, cfg.port_end, cfg.bind_host
            ))
        })?;

        let mut drivers: Vec<Box<dyn IoDriver>> = Vec::with_capacity(count);
        for index in 0..count {
            match make_driver(index) {
                Ok(driver) => drivers.push(driver),
                Err(e) => {
                    listeners.into_iter().for_each(socket::close);
                    return Err(e);
                }
            }
        }
        Ok((base, listeners, drivers))
    }

    /// Route one request. See the module docs.
    pub fn invoke(&self, request: Request) -> InvocationFuture {
        match self.route(request) {
            Ok(future) => future,
            Err(e) => {
                debug!(error = %e, "invocation rejected");
                InvocationFuture::failed(e)
            }
        }
    }

    fn route(&self, request: Request) -> Result<InvocationFuture> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(TpcError::ShuttingDown);
        }
        let Some(&local) = shared.local_address.get() else {
            return Err(TpcError::NotStarted);
        };
        let partition_id = request.partition_id;
        if partition_id < 0 {
            return Err(TpcError::InvalidPartition(partition_id));
        }
        let owner = shared
            .context
            .ownership
            .owner_of(partition_id)
            .ok_or(TpcError::NoOwner(partition_id))?;
        let index = hash_to_index(partition_id, shared.reactors.len());
        if !shared.reactors[index].is_alive() {
            return Err(TpcError::ReactorUnavailable(index));
        }
        if request.payload.len() > shared.config.max_message_size {
            return Err(TpcError::Protocol(format!(
                "payload of {} bytes exceeds max message size {}",
                request.payload.len(),
                shared.config.max_message_size
            )));
        }

        if owner == local {
            self.invoke_local(local, index, request)
        } else {
            self.invoke_remote(owner, index, request)
        }
    }

    /// Hand the request object to the owning reactor; nothing is encoded.
    fn invoke_local(&self, local: Address, index: usize, request: Request) -> Result<InvocationFuture> {
        let shared = &self.shared;
        let reactor = &shared.reactors[index];
        let table = shared.invocations.peer(local);

        if is_fire_and_forget(request.opcode) {
            let id = table.next_id();
            reactor.submit(Task::Local {
                request,
                correlation_id: None,
            })?;
            return Ok(InvocationFuture::ready(id, Ok(Bytes::new())));
        }

        let future = table.register(request.partition_id, index);
        let id = future.correlation_id();
        if shared.is_shutting_down() {
            table.fail(id, TpcError::ShuttingDown);
            return Ok(future);
        }
        if let Err(e) = reactor.submit(Task::Local {
            request,
            correlation_id: Some(id),
        }) {
            table.fail(id, e);
        }
        Ok(future)
    }

    fn invoke_remote(&self, owner: Address, index: usize, request: Request) -> Result<InvocationFuture> {
        let shared = &self.shared;
        let reactor = &shared.reactors[index];
        let link = shared.links.link(owner, index)?;
        link.acquire(reactor)?;
        let table = shared.invocations.peer(owner);

        if is_fire_and_forget(request.opcode) {
            let id = table.next_id();
            reactor.submit(Task::Write {
                link,
                bytes: self.encode_request(id, request),
                correlation_id: None,
            })?;
            return Ok(InvocationFuture::ready(id, Ok(Bytes::new())));
        }

        let future = table.register(request.partition_id, index);
        let id = future.correlation_id();
        if shared.is_shutting_down() {
            table.fail(id, TpcError::ShuttingDown);
            return Ok(future);
        }
        let submitted = reactor.submit(Task::Write {
            link,
            bytes: self.encode_request(id, request),
            correlation_id: Some(id),
        });
        match submitted {
            Err(e) => {
                table.fail(id, e);
            }
            Ok(()) if !reactor.is_alive() => {
                table.fail(id, TpcError::ReactorUnavailable(index));
            }
            Ok(()) => {}
        }
        Ok(future)
    }

    fn encode_request(&self, correlation_id: u64, request: Request) -> Bytes {
        let frame = Frame::request(
            request.opcode,
            correlation_id,
            request.partition_id,
            request.payload,
        );
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        self.shared
            .codec
            .encode_message(&frame, self.shared.config.fragment_threshold, &mut buf);
        buf.freeze()
    }

    /// Idempotent. Fails every outstanding invocation with `ShuttingDown`
    /// and tells every reactor to stop.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed = self.shared.invocations.fail_all(&TpcError::ShuttingDown);
        info!(failed, "engine shutting down");
        for reactor in &self.shared.reactors {
            reactor.stop();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Wait until every reactor thread has exited. `false` on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.shared.live.lock();
        while *live > 0 {
            if self.shared.terminated.wait_until(&mut live, deadline).timed_out() && *live > 0 {
                return false;
            }
        }
        drop(live);

        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
        true
    }

    /// Address of reactor 0. Peers reach reactor `i` at `port + i`.
    pub fn local_address(&self) -> Option<Address> {
        self.shared.local_address.get().copied()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn reactor_count(&self) -> usize {
        self.shared.reactors.len()
    }

    /// Local reactor serving `partition`.
    pub fn reactor_index(&self, partition: PartitionId) -> usize {
        hash_to_index(partition, self.shared.reactors.len())
    }

    pub fn reactor_stats(&self, index: usize) -> Option<ReactorStatsSnapshot> {
        self.shared.reactors.get(index).map(|r| r.stats())
    }

    pub fn outstanding_invocations(&self) -> usize {
        self.shared.invocations.outstanding()
    }

    /// Connections started towards `peer`, summed over reactor indexes.
    pub fn connect_requests(&self, peer: &Address) -> u64 {
        self.shared.links.connect_requests(peer)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
        if !self.await_termination(self.shared.config.termination_timeout) {
            warn!("reactors still running after termination timeout");
        }
    }
}

fn reactor_main(
    engine: Arc<EngineShared>,
    index: usize,
    driver: Box<dyn IoDriver>,
    listener: RawFd,
    local: Address,
) {
    let span = info_span!("reactor", index);
    let _enter = span.enter();
    let _guard = ExitGuard {
        engine: engine.clone(),
        index,
    };

    if engine.config.pin_threads {
        let cpu = affinity::cpu_for_reactor(index, engine.config.cpu_offset);
        match affinity::pin_current_thread(cpu) {
            Ok(()) => debug!(cpu, "pinned"),
            Err(e) => warn!(cpu, error = %e, "cannot pin reactor thread"),
        }
    }

    Reactor::new(index, engine, driver, listener, local).run();
}
