//! Opcode → operation execution on the owning reactor.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use bytes::{Bytes, BytesMut};
use tpc_core::error::{ErrorCode, RemoteError};
use tpc_core::partition::PartitionId;
use tracing::{error, warn};

use crate::ops::{is_fire_and_forget, OpContext, OperationPool, OperationRegistry, PartitionStore};

pub struct Dispatcher {
    pool: OperationPool,
    store: PartitionStore,
    output: BytesMut,
}

impl Dispatcher {
    pub fn new(registry: OperationRegistry, pool_capacity: usize) -> Self {
        Self {
            pool: OperationPool::new(registry, pool_capacity),
            store: PartitionStore::new(),
            output: BytesMut::new(),
        }
    }

    /// Run one request.
    ///
    /// `None` for fire-and-forget opcodes. Failures of any kind, including
    /// a panicking operation, come back as a `RemoteError` for the
    /// response frame.
    pub fn dispatch(
        &mut self,
        opcode: u8,
        partition_id: PartitionId,
        correlation_id: u64,
        payload: Bytes,
    ) -> Option<Result<Bytes, RemoteError>> {
        let fire_and_forget = is_fire_and_forget(opcode);

        let Some(mut op) = self.pool.acquire(opcode) else {
            warn!(opcode, correlation_id, "unknown opcode");
            return Some(Err(RemoteError::new(
                ErrorCode::UnknownOpcode,
                format!("unknown opcode {opcode}"),
            )));
        };

        let mut input = payload;
        self.output.clear();
        let Self { store, output, .. } = &mut *self;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            op.run(&mut OpContext {
                partition_id,
                correlation_id,
                input: &mut input,
                output,
                store,
            })
        }));

        let result = match outcome {
            Ok(Ok(())) => {
                self.pool.release(opcode, op);
                Ok(self.output.split().freeze())
            }
            Ok(Err(e)) => {
                self.pool.release(opcode, op);
                Err(RemoteError::from(e))
            }
            Err(panic) => {
                // A panicked instance may hold torn state; never pool it.
                let msg = panic_message(&*panic);
                error!(opcode, partition_id, correlation_id, panic = %msg, "operation panicked");
                Err(RemoteError::new(ErrorCode::OperationPanicked, msg))
            }
        };

        if fire_and_forget {
            if let Err(e) = &result {
                warn!(opcode, partition_id, error = %e.message, "fire-and-forget operation failed");
            }
            return None;
        }
        Some(result)
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "operation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{parse_lookup, upsert_payload, OpError, Opcode, Operation};

    struct Boom;

    impl Operation for Boom {
        fn run(&mut self, _ctx: &mut OpContext<'_>) -> Result<(), OpError> {
            panic!("boom");
        }
    }

    struct Refuse;

    impl Operation for Refuse {
        fn run(&mut self, _ctx: &mut OpContext<'_>) -> Result<(), OpError> {
            Err(OpError::Failed("not today".into()))
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = OperationRegistry::builtin();
        registry.register(100, || Box::new(Boom));
        registry.register(101, || Box::new(Refuse));
        Dispatcher::new(registry, 4)
    }

    #[test]
    fn test_echo_and_tables() {
        let mut d = dispatcher();
        let out = d.dispatch(Opcode::Echo as u8, 3, 501, Bytes::from_static(b"hi"));
        assert_eq!(out, Some(Ok(Bytes::from_static(b"hi"))));

        let out = d.dispatch(Opcode::TableUpsert as u8, 3, 502, upsert_payload(b"a", b"1"));
        assert_eq!(out.map(|r| r.map(parse_lookup)), Some(Ok(None)));
        let out = d
            .dispatch(Opcode::TableSelectByKey as u8, 3, 503, Bytes::from_static(b"a"))
            .unwrap()
            .unwrap();
        assert_eq!(parse_lookup(out), Some(Bytes::from_static(b"1")));

        // Other partitions do not see the entry.
        let out = d
            .dispatch(Opcode::TableSelectByKey as u8, 4, 504, Bytes::from_static(b"a"))
            .unwrap()
            .unwrap();
        assert_eq!(parse_lookup(out), None);
    }

    #[test]
    fn test_fire_and_forget_has_no_response() {
        let mut d = dispatcher();
        d.dispatch(Opcode::TableUpsert as u8, 1, 1, upsert_payload(b"k", b"v"));
        assert_eq!(d.dispatch(Opcode::TableEvict as u8, 1, 2, Bytes::from_static(b"k")), None);
        assert_eq!(d.store().len(1), 0);
    }

    #[test]
    fn test_unknown_opcode_fails_closed() {
        let mut d = dispatcher();
        let err = d.dispatch(250, 0, 9, Bytes::new()).unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownOpcode);
    }

    #[test]
    fn test_panic_becomes_error() {
        let mut d = dispatcher();
        let err = d.dispatch(100, 0, 1, Bytes::new()).unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::OperationPanicked);
        assert_eq!(err.message, "boom");

        // Dispatcher keeps working.
        let ok = d.dispatch(Opcode::Ping as u8, 0, 2, Bytes::new());
        assert_eq!(ok, Some(Ok(Bytes::new())));
    }

    #[test]
    fn test_operation_failure() {
        let mut d = dispatcher();
        let err = d.dispatch(101, 0, 1, Bytes::new()).unwrap().unwrap_err();
        assert_eq!(err, RemoteError::new(ErrorCode::OperationFailed, "not today"));
    }
}
