//! Completion-queue I/O driver abstraction.
//!
//! A reactor owns exactly one driver and is its only user. Operations are
//! submitted with a caller-chosen 64-bit token and come back as
//! [`IoCompletion`]s carrying the same token and a syscall-style result
//! (bytes transferred, or a negative errno).
//!
//! # Implementors
//!
//! - `UringDriver` (tpc-module): one io_uring per reactor. Submissions are
//!   queued as SQEs and kicked by `submit_and_wait`.
//!
//! - `PollDriver` (tpc-module): emulates completions on top of `poll(2)` and
//!   nonblocking syscalls, for kernels or sandboxes that refuse
//!   `io_uring_setup`.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;

/// One asynchronous operation.
///
/// Pointer-carrying variants reference memory owned by the submitter; it
/// must stay valid and unaliased until the matching completion is drained.
#[derive(Debug, Clone, Copy)]
pub enum IoOp {
    /// Accept one connection; result is the new (nonblocking) fd.
    Accept { fd: RawFd },
    Connect {
        fd: RawFd,
        addr: *const libc::sockaddr,
        addr_len: libc::socklen_t,
    },
    Recv { fd: RawFd, buf: *mut u8, len: u32 },
    Send { fd: RawFd, buf: *const u8, len: u32 },
    /// Plain read, used for the wakeup descriptor.
    Read { fd: RawFd, buf: *mut u8, len: u32 },
    /// Completes after the delay with result 0, or `-ECANCELED`.
    Timeout { after: Duration },
}

// Raw pointers make IoOp !Send by default; ops only move between a reactor and
// the driver it owns, on the same thread.
unsafe impl Send for IoOp {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    pub token: u64,
    /// Byte count / fd / 0 on success, negative errno on failure.
    pub result: i32,
}

pub trait IoDriver: Send {
    /// Queue an operation. Never blocks.
    ///
    /// # Safety
    ///
    /// Buffers and addresses referenced by `op` must outlive the operation,
    /// i.e. stay valid until its completion has been drained.
    unsafe fn submit(&mut self, token: u64, op: IoOp) -> Result<()>;

    /// Request cancellation of the operation submitted with `token`.
    ///
    /// Best-effort. The operation still produces exactly one completion,
    /// usually with `-ECANCELED`.
    fn cancel(&mut self, token: u64) -> Result<()>;

    /// Push queued submissions and block until at least `min_complete`
    /// completions are ready. `0` never blocks. An interrupted wait returns
    /// `Ok` early.
    fn submit_and_wait(&mut self, min_complete: usize) -> Result<usize>;

    /// True when completions are ready to drain without waiting.
    fn has_completions(&mut self) -> bool;

    /// Move up to `max` ready completions into `out`. Returns how many.
    fn drain(&mut self, out: &mut Vec<IoCompletion>, max: usize) -> usize;

    /// Operations submitted whose completion has not been drained yet.
    fn inflight(&self) -> usize;

    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;
}
