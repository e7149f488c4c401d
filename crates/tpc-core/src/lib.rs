//! # tpc-core: shared types and trait boundaries for the thread-per-core engine
//!
//! Nothing in this crate spawns a thread or opens a socket. It defines:
//!
//! - the wire [`frame`] format and its stateless codec,
//! - [`fragment`] reassembly for messages split across frames,
//! - the [`io_driver::IoDriver`] completion-queue abstraction,
//! - the [`wakeup::WakeupSignal`] used to break a blocked reactor wait,
//! - addressing and partition-to-reactor hashing,
//! - the error taxonomy shared by every layer.
//!
//! OS-facing implementations live in `tpc-module`; the reactor, channels and
//! invocation routing live in `tpc-engine`.

pub mod address;
pub mod env;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod io_driver;
pub mod partition;
pub mod wakeup;

pub use address::Address;
pub use error::{Result, TpcError};
pub use frame::{Frame, FrameCodec, FrameError};
pub use partition::{PartitionId, PartitionOwnership};
