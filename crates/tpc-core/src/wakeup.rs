//! Cross-thread wakeup for a reactor blocked in its completion wait.
//!
//! The reactor keeps a read permanently armed on [`WakeupSignal::read_fd`];
//! any thread calling [`WakeupSignal::signal`] makes that read complete and
//! the wait return.
//!
//! # Implementors
//!
//! - `EventFdSignal` (tpc-module, Linux): one eventfd, counter semantics.
//! - `PipeSignal` (tpc-module, other unix): nonblocking self-pipe.

use std::os::unix::io::RawFd;

use crate::error::Result;

pub trait WakeupSignal: Send + Sync {
    /// Make the armed read complete. A signal that is already pending is
    /// not an error.
    fn signal(&self) -> Result<()>;

    /// Descriptor the reactor reads from.
    fn read_fd(&self) -> RawFd;
}
