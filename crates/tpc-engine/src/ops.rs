//! Operations executed against reactor-local partition state.
//!
//! The opcode set is closed: [`Opcode`] lists what the engine serves and
//! [`OperationRegistry`] maps every opcode byte to a constructor. Instances
//! are pooled per reactor and `reset` between uses.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tpc_core::error::{ErrorCode, RemoteError, Result, TpcError};
use tpc_core::partition::PartitionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ping = 0,
    Echo = 1,
    /// `[u32 key_len][key][value]` → `[u8 found][previous value]`
    TableUpsert = 2,
    /// `key` → `[u8 found][value]`
    TableSelectByKey = 3,
    /// `key` → no response
    TableEvict = 4,
}

impl Opcode {
    pub const ALL: [Opcode; 5] = [
        Opcode::Ping,
        Opcode::Echo,
        Opcode::TableUpsert,
        Opcode::TableSelectByKey,
        Opcode::TableEvict,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u8 == v)
    }

    /// No response frame is produced and the caller's future completes on
    /// hand-off.
    pub fn is_fire_and_forget(self) -> bool {
        matches!(self, Opcode::TableEvict)
    }
}

/// Whether a raw opcode byte is a known fire-and-forget opcode.
pub fn is_fire_and_forget(opcode: u8) -> bool {
    Opcode::from_u8(opcode).is_some_and(Opcode::is_fire_and_forget)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("{0}")]
    Failed(String),
}

impl From<OpError> for RemoteError {
    fn from(e: OpError) -> Self {
        match e {
            OpError::Malformed(msg) => RemoteError::new(ErrorCode::MalformedRequest, msg),
            OpError::Failed(msg) => RemoteError::new(ErrorCode::OperationFailed, msg),
        }
    }
}

/// Key/value tables of every partition owned by one reactor.
///
/// Only ever touched by that reactor's thread.
#[derive(Debug, Default)]
pub struct PartitionStore {
    partitions: HashMap<PartitionId, HashMap<Bytes, Bytes>>,
}

impl PartitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, partition: PartitionId, key: Bytes, value: Bytes) -> Option<Bytes> {
        self.partitions.entry(partition).or_default().insert(key, value)
    }

    pub fn get(&self, partition: PartitionId, key: &[u8]) -> Option<&Bytes> {
        self.partitions.get(&partition)?.get(key)
    }

    pub fn evict(&mut self, partition: PartitionId, key: &[u8]) -> Option<Bytes> {
        let table = self.partitions.get_mut(&partition)?;
        let old = table.remove(key);
        if table.is_empty() {
            self.partitions.remove(&partition);
        }
        old
    }

    /// Entries held for `partition`.
    pub fn len(&self, partition: PartitionId) -> usize {
        self.partitions.get(&partition).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Everything an operation sees while it runs.
pub struct OpContext<'a> {
    pub partition_id: PartitionId,
    pub correlation_id: u64,
    /// Cursor over the request payload.
    pub input: &'a mut Bytes,
    pub output: &'a mut BytesMut,
    pub store: &'a mut PartitionStore,
}

pub trait Operation {
    fn run(&mut self, ctx: &mut OpContext<'_>) -> std::result::Result<(), OpError>;

    /// Clear per-invocation state before the instance goes back to the pool.
    fn reset(&mut self) {}
}

pub type OpConstructor = fn() -> Box<dyn Operation>;

#[derive(Clone)]
pub struct OperationRegistry {
    slots: Vec<Option<OpConstructor>>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl OperationRegistry {
    pub fn empty() -> Self {
        Self {
            slots: vec![None; 256],
        }
    }

    /// A constructor for every [`Opcode`].
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register(Opcode::Ping as u8, || Box::new(Ping));
        r.register(Opcode::Echo as u8, || Box::new(Echo));
        r.register(Opcode::TableUpsert as u8, || Box::new(Upsert::default()));
        r.register(Opcode::TableSelectByKey as u8, || Box::new(SelectByKey));
        r.register(Opcode::TableEvict as u8, || Box::new(Evict));
        r
    }

    /// Install or replace the constructor for `opcode`.
    pub fn register(&mut self, opcode: u8, ctor: OpConstructor) -> &mut Self {
        self.slots[opcode as usize] = Some(ctor);
        self
    }

    pub fn constructor(&self, opcode: u8) -> Option<OpConstructor> {
        self.slots[opcode as usize]
    }

    /// Fail if any of `required` has no constructor.
    pub fn ensure_complete(&self, required: &[Opcode]) -> Result<()> {
        let missing: Vec<_> = required
            .iter()
            .filter(|op| self.constructor(**op as u8).is_none())
            .map(|op| format!("{op:?}"))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TpcError::Config(format!(
                "no operation registered for {}",
                missing.join(", ")
            )))
        }
    }
}

/// Per-opcode free lists of operation instances.
pub struct OperationPool {
    registry: OperationRegistry,
    free: Vec<Vec<Box<dyn Operation>>>,
    capacity: usize,
    created: u64,
}

impl OperationPool {
    pub fn new(registry: OperationRegistry, capacity: usize) -> Self {
        Self {
            registry,
            free: (0..256).map(|_| Vec::new()).collect(),
            capacity,
            created: 0,
        }
    }

    /// A reset instance for `opcode`, or `None` if the opcode is unregistered.
    pub fn acquire(&mut self, opcode: u8) -> Option<Box<dyn Operation>> {
        if let Some(op) = self.free[opcode as usize].pop() {
            return Some(op);
        }
        let ctor = self.registry.constructor(opcode)?;
        self.created += 1;
        Some(ctor())
    }

    pub fn release(&mut self, opcode: u8, mut op: Box<dyn Operation>) {
        let list = &mut self.free[opcode as usize];
        if list.len() < self.capacity {
            op.reset();
            list.push(op);
        }
    }

    /// Instances constructed over the pool's lifetime.
    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn pooled(&self, opcode: u8) -> usize {
        self.free[opcode as usize].len()
    }
}

// ── Built-in operations ──

struct Ping;

impl Operation for Ping {
    fn run(&mut self, _ctx: &mut OpContext<'_>) -> std::result::Result<(), OpError> {
        Ok(())
    }
}

struct Echo;

impl Operation for Echo {
    fn run(&mut self, ctx: &mut OpContext<'_>) -> std::result::Result<(), OpError> {
        ctx.output.extend_from_slice(&ctx.input[..]);
        ctx.input.advance(ctx.input.len());
        Ok(())
    }
}

#[derive(Default)]
struct Upsert {
    key: Bytes,
    value: Bytes,
}

impl Operation for Upsert {
    fn run(&mut self, ctx: &mut OpContext<'_>) -> std::result::Result<(), OpError> {
        if ctx.input.remaining() < 4 {
            return Err(OpError::Malformed("missing key length".into()));
        }
        let key_len = ctx.input.get_u32() as usize;
        if ctx.input.remaining() < key_len {
            return Err(OpError::Malformed(format!(
                "key length {key_len} exceeds payload"
            )));
        }
        self.key = ctx.input.split_to(key_len);
        self.value = ctx.input.split_to(ctx.input.remaining());

        let previous = ctx.store.upsert(
            ctx.partition_id,
            std::mem::take(&mut self.key),
            std::mem::take(&mut self.value),
        );
        write_lookup(ctx.output, previous.as_ref());
        Ok(())
    }

    fn reset(&mut self) {
        self.key = Bytes::new();
        self.value = Bytes::new();
    }
}

struct SelectByKey;

impl Operation for SelectByKey {
    fn run(&mut self, ctx: &mut OpContext<'_>) -> std::result::Result<(), OpError> {
        let value = ctx.store.get(ctx.partition_id, &ctx.input[..]).cloned();
        write_lookup(ctx.output, value.as_ref());
        Ok(())
    }
}

struct Evict;

impl Operation for Evict {
    fn run(&mut self, ctx: &mut OpContext<'_>) -> std::result::Result<(), OpError> {
        ctx.store.evict(ctx.partition_id, &ctx.input[..]);
        Ok(())
    }
}

/// `[u8 found][value]`
fn write_lookup(out: &mut BytesMut, value: Option<&Bytes>) {
    match value {
        Some(v) => {
            out.put_u8(1);
            out.put_slice(v);
        }
        None => out.put_u8(0),
    }
}

/// Payload of a `TableUpsert` request.
pub fn upsert_payload(key: &[u8], value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + key.len() + value.len());
    buf.put_u32(key.len() as u32);
    buf.put_slice(key);
    buf.put_slice(value);
    buf.freeze()
}

/// Split a `[u8 found][value]` response. `None` means not found.
pub fn parse_lookup(mut payload: Bytes) -> Option<Bytes> {
    if payload.is_empty() || payload.get_u8() == 0 {
        return None;
    }
    Some(payload)
}
