//! # tpc-module: OS-facing implementations of the tpc-core traits
//!
//! ## Default stack
//!
//! | Trait          | Default impl    | Fallback                      |
//! |----------------|-----------------|-------------------------------|
//! | IoDriver       | UringDriver     | PollDriver (io_uring refused) |
//! | WakeupSignal   | EventFdSignal   | PipeSignal (non-Linux)        |
//!
//! plus nonblocking socket helpers and reactor CPU pinning.

pub mod affinity;
pub mod driver;
pub mod poll_driver;
pub mod socket;
#[cfg(target_os = "linux")]
pub mod uring_driver;
pub mod wakeup;

pub use driver::{new_driver, DriverKind};
pub use wakeup::new_signal;
