//! Outbound connection pool: one link per (peer, local reactor index).
//!
//! A link is a non-owning handle. The channel itself lives in the slab of
//! the reactor with the same index; the link only records whether a
//! connection exists or is being set up, so that concurrent first use
//! produces a single `Connect` task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tpc_core::address::Address;
use tpc_core::error::{Result, TpcError};

use crate::reactor::{ReactorShared, Task};

const IDLE: u8 = 0;
const CONNECTING: u8 = 1;
const OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
}

pub struct PeerLink {
    peer: Address,
    index: usize,
    endpoint: SocketAddr,
    state: AtomicU8,
    lock: Mutex<()>,
    connects: AtomicU64,
}

impl PeerLink {
    fn new(peer: Address, index: usize, endpoint: SocketAddr) -> Self {
        Self {
            peer,
            index,
            endpoint,
            state: AtomicU8::new(IDLE),
            lock: Mutex::new(()),
            connects: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> Address {
        self.peer
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Listening endpoint of the peer's reactor with the same index.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            IDLE => LinkState::Idle,
            CONNECTING => LinkState::Connecting,
            _ => LinkState::Open,
        }
    }

    /// Make sure a connection exists or is on its way.
    ///
    /// Fast path is one atomic load. On the slow path the `Connect` task is
    /// queued before the state leaves `Idle`, so any caller that observes
    /// `Connecting` queues its writes behind it.
    pub fn acquire(self: &Arc<Self>, reactor: &ReactorShared) -> Result<()> {
        if self.state.load(Ordering::Acquire) != IDLE {
            return Ok(());
        }
        let _guard = self.lock.lock();
        if self.state.load(Ordering::Acquire) != IDLE {
            return Ok(());
        }
        reactor.submit(Task::Connect(self.clone()))?;
        self.state.store(CONNECTING, Ordering::Release);
        Ok(())
    }

    /// Reactor side: a connection attempt sequence started.
    pub(crate) fn connect_started(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let _guard = self.lock.lock();
        if self.state.load(Ordering::Acquire) == IDLE {
            self.state.store(CONNECTING, Ordering::Release);
        }
    }

    pub(crate) fn mark_open(&self) {
        self.state.store(OPEN, Ordering::Release);
    }

    /// Back to idle; the next `acquire` reconnects.
    pub(crate) fn reset(&self) {
        let _guard = self.lock.lock();
        self.state.store(IDLE, Ordering::Release);
    }

    /// Connections started for this link.
    pub fn connect_requests(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

/// All links, per peer. Links are created once and never removed.
pub struct PeerPool {
    reactor_count: usize,
    links: RwLock<HashMap<Address, Arc<[Arc<PeerLink>]>>>,
}

impl PeerPool {
    pub fn new(reactor_count: usize) -> Self {
        Self {
            reactor_count,
            links: RwLock::new(HashMap::new()),
        }
    }

    pub fn link(&self, peer: Address, index: usize) -> Result<Arc<PeerLink>> {
        let existing = self.links.read().get(&peer).cloned();
        let links = match existing {
            Some(links) => links,
            None => self.create(peer)?,
        };
        links
            .get(index)
            .cloned()
            .ok_or_else(|| TpcError::Config(format!("reactor index {index} out of range")))
    }

    fn create(&self, peer: Address) -> Result<Arc<[Arc<PeerLink>]>> {
        let mut map = self.links.write();
        if let Some(links) = map.get(&peer) {
            return Ok(links.clone());
        }
        let links = (0..self.reactor_count)
            .map(|i| {
                let endpoint = peer.reactor_endpoint(i).ok_or_else(|| {
                    TpcError::Config(format!("no port for reactor {i} of {peer}"))
                })?;
                Ok(Arc::new(PeerLink::new(peer, i, endpoint)))
            })
            .collect::<Result<Vec<_>>>()?;
        let links: Arc<[Arc<PeerLink>]> = links.into();
        map.insert(peer, links.clone());
        Ok(links)
    }

    /// Connections started towards `peer` over all reactor indexes.
    pub fn connect_requests(&self, peer: &Address) -> u64 {
        self.links
            .read()
            .get(peer)
            .map_or(0, |links| links.iter().map(|l| l.connect_requests()).sum())
    }
}
