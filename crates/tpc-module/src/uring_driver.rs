//! `UringDriver`: default `IoDriver`, one io_uring per reactor.
//!
//! No SQPOLL, no fixed files, no registered buffers. Submissions are queued
//! as SQEs and only reach the kernel in `submit_and_wait`, so a reactor
//! iteration costs one `io_uring_enter` however many operations it issued.

use std::collections::HashMap;
use std::ptr;

use io_uring::{opcode, types, IoUring};
use tpc_core::error::{Result, TpcError};
use tpc_core::io_driver::{IoCompletion, IoDriver, IoOp};

/// user_data of AsyncCancel SQEs; their own CQEs are swallowed.
const CANCEL_TOKEN: u64 = u64::MAX;

pub struct UringDriver {
    ring: IoUring,
    inflight: usize,
    /// Timeout specs must stay addressable until the timeout completes.
    timeouts: HashMap<u64, Box<types::Timespec>>,
}

impl UringDriver {
    /// `entries` SQ slots (rounded up to a power of two by the kernel).
    pub fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| TpcError::Driver(e.raw_os_error().unwrap_or(libc::EINVAL)))?;
        Ok(Self {
            ring,
            inflight: 0,
            timeouts: HashMap::new(),
        })
    }

    /// Push one SQE, flushing the SQ to the kernel once if it is full.
    fn push(&mut self, sqe: io_uring::squeue::Entry) -> Result<()> {
        for attempt in 0..2 {
            if unsafe { self.ring.submission().push(&sqe) }.is_ok() {
                return Ok(());
            }
            if attempt == 0 {
                self.ring
                    .submit()
                    .map_err(|e| TpcError::Driver(e.raw_os_error().unwrap_or(libc::EIO)))?;
            }
        }
        Err(TpcError::Driver(libc::EBUSY))
    }
}

impl IoDriver for UringDriver {
    unsafe fn submit(&mut self, token: u64, op: IoOp) -> Result<()> {
        let sqe = match op {
            IoOp::Accept { fd } => opcode::Accept::new(types::Fd(fd), ptr::null_mut(), ptr::null_mut())
                .flags(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
                .build(),
            IoOp::Connect { fd, addr, addr_len } => {
                opcode::Connect::new(types::Fd(fd), addr, addr_len).build()
            }
            IoOp::Recv { fd, buf, len } => opcode::Recv::new(types::Fd(fd), buf, len).build(),
            IoOp::Send { fd, buf, len } => opcode::Send::new(types::Fd(fd), buf, len)
                .flags(libc::MSG_NOSIGNAL)
                .build(),
            IoOp::Read { fd, buf, len } => opcode::Read::new(types::Fd(fd), buf, len)
                .offset(u64::MAX)
                .build(),
            IoOp::Timeout { after } => {
                let ts = Box::new(
                    types::Timespec::new()
                        .sec(after.as_secs())
                        .nsec(after.subsec_nanos()),
                );
                let sqe = opcode::Timeout::new(&*ts as *const types::Timespec).build();
                self.timeouts.insert(token, ts);
                sqe
            }
        };

        if let Err(e) = self.push(sqe.user_data(token)) {
            self.timeouts.remove(&token);
            return Err(e);
        }
        self.inflight += 1;
        Ok(())
    }

    fn cancel(&mut self, token: u64) -> Result<()> {
        let sqe = opcode::AsyncCancel::new(token).build().user_data(CANCEL_TOKEN);
        self.push(sqe)
    }

    fn submit_and_wait(&mut self, min_complete: usize) -> Result<usize> {
        match self.ring.submit_and_wait(min_complete) {
            Ok(n) => Ok(n),
            Err(e) => match e.raw_os_error() {
                // Interrupted, or CQ overflow pending: drain and come back.
                Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN) => Ok(0),
                Some(errno) => Err(TpcError::Driver(errno)),
                None => Err(TpcError::Driver(libc::EIO)),
            },
        }
    }

    fn has_completions(&mut self) -> bool {
        !self.ring.completion().is_empty()
    }

    fn drain(&mut self, out: &mut Vec<IoCompletion>, max: usize) -> usize {
        let mut n = 0;
        let mut cq = self.ring.completion();
        while n < max {
            let Some(cqe) = cq.next() else { break };
            let token = cqe.user_data();
            if token == CANCEL_TOKEN {
                continue;
            }
            let mut result = cqe.result();
            if self.timeouts.remove(&token).is_some() && result == -libc::ETIME {
                result = 0;
            }
            self.inflight = self.inflight.saturating_sub(1);
            out.push(IoCompletion { token, result });
            n += 1;
        }
        n
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn name(&self) -> &'static str {
        "io_uring"
    }
}
