//! `PollDriver`: completion emulation on top of `poll(2)`.
//!
//! Each submitted operation is attempted with a nonblocking syscall. If it
//! would block, its descriptor joins the next `poll(2)` set and the syscall
//! is retried once the descriptor reports readiness. Timers are kept in a
//! flat list and bound the poll timeout.
//!
//! Intended for environments that refuse `io_uring_setup` (seccomp'd
//! containers, old kernels). Semantics match `UringDriver` closely enough
//! that the reactor does not care which one it drives.

use std::collections::VecDeque;
use std::time::Instant;

use nix::errno::Errno;
use tpc_core::error::{Result, TpcError};
use tpc_core::io_driver::{IoCompletion, IoDriver, IoOp};

struct Pending {
    token: u64,
    op: IoOp,
    /// Waiting for readiness before the next attempt.
    armed: bool,
    /// Nonblocking connect returned EINPROGRESS.
    connecting: bool,
}

pub struct PollDriver {
    pending: Vec<Pending>,
    timers: Vec<(Instant, u64)>,
    ready: VecDeque<IoCompletion>,
    pollfds: Vec<libc::pollfd>,
    poll_index: Vec<usize>,
}

impl Default for PollDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PollDriver {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            timers: Vec::new(),
            ready: VecDeque::new(),
            pollfds: Vec::new(),
            poll_index: Vec::new(),
        }
    }

    /// Attempt every unarmed operation once.
    fn progress(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].armed {
                i += 1;
                continue;
            }
            match attempt(&mut self.pending[i]) {
                Some(result) => {
                    let done = self.pending.swap_remove(i);
                    self.ready.push_back(IoCompletion {
                        token: done.token,
                        result,
                    });
                }
                None => i += 1,
            }
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        let ready = &mut self.ready;
        self.timers.retain(|&(deadline, token)| {
            if deadline <= now {
                ready.push_back(IoCompletion { token, result: 0 });
                false
            } else {
                true
            }
        });
    }

    /// Milliseconds until the nearest timer, -1 if none.
    fn next_timeout_ms(&self, now: Instant) -> i32 {
        match self.timers.iter().map(|&(d, _)| d).min() {
            None => -1,
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(now);
                // Round up so a wakeup never lands just before the deadline.
                let ms = wait.as_millis() + u128::from(wait.subsec_nanos() % 1_000_000 != 0);
                ms.min(i32::MAX as u128) as i32
            }
        }
    }

    fn poll_once(&mut self, timeout_ms: i32) -> Result<()> {
        self.pollfds.clear();
        self.poll_index.clear();
        for (i, p) in self.pending.iter().enumerate() {
            if p.armed {
                let (fd, events) = interest(&p.op);
                self.pollfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                self.poll_index.push(i);
            }
        }

        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                return Ok(());
            }
            return Err(TpcError::Driver(errno as i32));
        }
        for (pfd, &i) in self.pollfds.iter().zip(&self.poll_index) {
            if pfd.revents != 0 {
                self.pending[i].armed = false;
            }
        }
        Ok(())
    }
}

fn interest(op: &IoOp) -> (i32, libc::c_short) {
    match *op {
        IoOp::Accept { fd } | IoOp::Recv { fd, .. } | IoOp::Read { fd, .. } => (fd, libc::POLLIN),
        IoOp::Send { fd, .. } | IoOp::Connect { fd, .. } => (fd, libc::POLLOUT),
        IoOp::Timeout { .. } => (-1, 0),
    }
}

/// One nonblocking attempt. `Some(result)` completes the operation.
fn attempt(p: &mut Pending) -> Option<i32> {
    let ret = unsafe {
        match p.op {
            IoOp::Accept { fd } => libc::accept4(
                fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            ) as isize,
            IoOp::Recv { fd, buf, len } => libc::recv(fd, buf.cast(), len as usize, libc::MSG_DONTWAIT),
            IoOp::Send { fd, buf, len } => libc::send(
                fd,
                buf.cast(),
                len as usize,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            ),
            IoOp::Read { fd, buf, len } => libc::read(fd, buf.cast(), len as usize),
            IoOp::Connect { fd, .. } if p.connecting => {
                return Some(match socket_error(fd) {
                    0 => 0,
                    err => -err,
                });
            }
            IoOp::Connect { fd, addr, addr_len } => libc::connect(fd, addr, addr_len) as isize,
            IoOp::Timeout { .. } => return Some(0),
        }
    };

    if ret >= 0 {
        return Some(ret.min(i32::MAX as isize) as i32);
    }
    match Errno::last() {
        Errno::EAGAIN | Errno::EALREADY => {
            p.armed = true;
            None
        }
        Errno::EINPROGRESS => {
            p.armed = true;
            p.connecting = true;
            None
        }
        Errno::EINTR => None,
        errno => Some(-(errno as i32)),
    }
}

fn socket_error(fd: i32) -> i32 {
    match crate::socket::take_error(fd) {
        Ok(err) => err,
        Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
    }
}

impl IoDriver for PollDriver {
    unsafe fn submit(&mut self, token: u64, op: IoOp) -> Result<()> {
        match op {
            IoOp::Timeout { after } => self.timers.push((Instant::now() + after, token)),
            op => self.pending.push(Pending {
                token,
                op,
                armed: false,
                connecting: false,
            }),
        }
        Ok(())
    }

    fn cancel(&mut self, token: u64) -> Result<()> {
        let canceled = IoCompletion {
            token,
            result: -libc::ECANCELED,
        };
        if let Some(i) = self.pending.iter().position(|p| p.token == token) {
            self.pending.swap_remove(i);
            self.ready.push_back(canceled);
        } else if let Some(i) = self.timers.iter().position(|&(_, t)| t == token) {
            self.timers.swap_remove(i);
            self.ready.push_back(canceled);
        }
        Ok(())
    }

    fn submit_and_wait(&mut self, min_complete: usize) -> Result<usize> {
        let mut waited = false;
        loop {
            self.progress();
            self.fire_timers(Instant::now());
            if self.ready.len() >= min_complete && (min_complete > 0 || waited) {
                return Ok(self.ready.len());
            }

            let timeout = if min_complete == 0 {
                0
            } else {
                self.next_timeout_ms(Instant::now())
            };
            if timeout < 0 && !self.pending.iter().any(|p| p.armed) {
                // Nothing can ever complete.
                return Ok(self.ready.len());
            }
            self.poll_once(timeout)?;
            waited = true;
        }
    }

    fn has_completions(&mut self) -> bool {
        !self.ready.is_empty()
    }

    fn drain(&mut self, out: &mut Vec<IoCompletion>, max: usize) -> usize {
        let n = max.min(self.ready.len());
        out.extend(self.ready.drain(..n));
        n
    }

    fn inflight(&self) -> usize {
        self.pending.len() + self.timers.len() + self.ready.len()
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
