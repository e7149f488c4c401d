//! # tpc-engine: thread-per-core reactors with partition-affine routing
//!
//! An [`Engine`] runs one reactor per configured core. Each reactor is a
//! single OS thread owning an I/O completion driver, a listening socket on
//! `base_port + index`, the channels it accepted or opened, and the state of
//! every partition that hashes to it. Nothing on the request path is shared
//! between reactors; other threads talk to a reactor only through its task
//! queue.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tpc_engine::{Engine, EngineConfig, EngineContext, Opcode, Request, StaticOwnership};
//!
//! let ownership = Arc::new(StaticOwnership::new());
//! let engine = Engine::new(EngineConfig::from_env(), EngineContext::new(ownership.clone()))?;
//! engine.start()?;
//! ownership.set_default(engine.local_address());
//!
//! let reply = engine.invoke(Request::new(Opcode::Echo, 3, "hello")).wait()?;
//! engine.shutdown();
//! engine.await_termination(std::time::Duration::from_secs(5));
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod future;
pub mod invocation;
pub mod ops;
pub mod pool;
pub mod reactor;
pub mod task_queue;

pub use config::{EngineConfig, SchedulingMode};
pub use context::{EngineContext, StaticOwnership};
pub use engine::{Engine, Request};
pub use future::InvocationFuture;
pub use ops::{OpContext, OpError, Opcode, Operation, OperationRegistry};
pub use reactor::ReactorStatsSnapshot;

pub use tpc_core::{Address, PartitionId, PartitionOwnership, TpcError};
