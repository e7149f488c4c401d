//! Pending invocations, per peer, keyed by correlation id.
//!
//! Written from caller threads (`register`) and from reactor threads
//! (`complete`, `fail_*`). Every completion path removes the entry from the
//! map first and completes it afterwards, outside the lock; whoever wins the
//! removal delivers the one and only result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tpc_core::address::Address;
use tpc_core::error::{Result, TpcError};
use tpc_core::partition::PartitionId;
use tracing::trace;

use crate::future::{completion, Completer, InvocationFuture};

/// First correlation id handed out is `INITIAL_CORRELATION_ID + 1`.
pub const INITIAL_CORRELATION_ID: u64 = 500;

pub struct Invocation {
    pub correlation_id: u64,
    pub partition_id: PartitionId,
    /// Local reactor the request was routed through.
    pub reactor_index: usize,
    pub submitted_at: Instant,
    completer: Completer<Bytes>,
}

impl Invocation {
    fn complete(self, result: Result<Bytes>) -> bool {
        trace!(
            correlation_id = self.correlation_id,
            elapsed_us = self.submitted_at.elapsed().as_micros() as u64,
            ok = result.is_ok(),
            "invocation complete"
        );
        self.completer.complete(result)
    }
}

pub struct PeerInvocations {
    address: Address,
    counter: AtomicU64,
    pending: Mutex<HashMap<u64, Invocation>>,
}

impl PeerInvocations {
    fn new(address: Address) -> Self {
        Self {
            address,
            counter: AtomicU64::new(INITIAL_CORRELATION_ID),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Next correlation id for this peer. Never repeats within the process.
    pub fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, partition_id: PartitionId, reactor_index: usize) -> InvocationFuture {
        let correlation_id = self.next_id();
        let (completer, rx) = completion();
        self.pending.lock().insert(
            correlation_id,
            Invocation {
                correlation_id,
                partition_id,
                reactor_index,
                submitted_at: Instant::now(),
                completer,
            },
        );
        InvocationFuture::new(correlation_id, rx)
    }

    /// `false` if no invocation with that id is pending.
    pub fn complete(&self, correlation_id: u64, result: Result<Bytes>) -> bool {
        let inv = self.pending.lock().remove(&correlation_id);
        match inv {
            Some(inv) => inv.complete(result),
            None => false,
        }
    }

    pub fn fail(&self, correlation_id: u64, err: TpcError) -> bool {
        self.complete(correlation_id, Err(err))
    }

    /// Fail every pending invocation matching `pred`. Returns how many.
    pub fn fail_where(&self, err: &TpcError, pred: impl Fn(&Invocation) -> bool) -> usize {
        let failed: Vec<Invocation> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .values()
                .filter(|inv| pred(inv))
                .map(|inv| inv.correlation_id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let n = failed.len();
        for inv in failed {
            inv.complete(Err(err.clone()));
        }
        n
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

#[derive(Default)]
pub struct InvocationTable {
    peers: RwLock<HashMap<Address, Arc<PeerInvocations>>>,
}

impl InvocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table for `address`, created on first use and kept for the
    /// lifetime of the engine.
    pub fn peer(&self, address: Address) -> Arc<PeerInvocations> {
        if let Some(p) = self.peers.read().get(&address) {
            return p.clone();
        }
        self.peers
            .write()
            .entry(address)
            .or_insert_with(|| Arc::new(PeerInvocations::new(address)))
            .clone()
    }

    pub fn get(&self, address: &Address) -> Option<Arc<PeerInvocations>> {
        self.peers.read().get(address).cloned()
    }

    pub fn complete(&self, address: &Address, correlation_id: u64, result: Result<Bytes>) -> bool {
        self.get(address)
            .is_some_and(|p| p.complete(correlation_id, result))
    }

    pub fn fail(&self, address: &Address, correlation_id: u64, err: TpcError) -> bool {
        self.complete(address, correlation_id, Err(err))
    }

    fn snapshot(&self) -> Vec<Arc<PeerInvocations>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn fail_all(&self, err: &TpcError) -> usize {
        self.snapshot()
            .iter()
            .map(|p| p.fail_where(err, |_| true))
            .sum()
    }

    /// Fail the invocations sent to `address` through local reactor `index`.
    pub fn fail_routed(&self, address: &Address, index: usize, err: &TpcError) -> usize {
        self.get(address)
            .map_or(0, |p| p.fail_where(err, |inv| inv.reactor_index == index))
    }

    /// Fail every invocation routed through local reactor `index`, any peer.
    pub fn fail_reactor(&self, index: usize, err: &TpcError) -> usize {
        self.snapshot()
            .iter()
            .map(|p| p.fail_where(err, |inv| inv.reactor_index == index))
            .sum()
    }

    pub fn outstanding(&self) -> usize {
        self.snapshot().iter().map(|p| p.outstanding()).sum()
    }
}
