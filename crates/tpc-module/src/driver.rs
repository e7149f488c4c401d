//! Driver selection.

use std::fmt;
use std::str::FromStr;

use tpc_core::error::{Result, TpcError};
use tpc_core::io_driver::IoDriver;
use tracing::warn;

use crate::poll_driver::PollDriver;

/// Which completion backend a reactor runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    /// io_uring, falling back to poll if the ring cannot be created.
    #[default]
    Auto,
    IoUring,
    Poll,
}

impl FromStr for DriverKind {
    type Err = TpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "io_uring" | "iouring" | "uring" => Ok(Self::IoUring),
            "poll" => Ok(Self::Poll),
            other => Err(TpcError::Config(format!("unknown I/O driver '{other}'"))),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::IoUring => "io_uring",
            Self::Poll => "poll",
        })
    }
}

#[cfg(target_os = "linux")]
fn new_uring(entries: u32) -> Result<Box<dyn IoDriver>> {
    Ok(Box::new(crate::uring_driver::UringDriver::new(entries)?))
}

#[cfg(not(target_os = "linux"))]
fn new_uring(_entries: u32) -> Result<Box<dyn IoDriver>> {
    Err(TpcError::Driver(libc::ENOSYS))
}

/// Build a driver of the requested kind with `entries` submission slots.
pub fn new_driver(kind: DriverKind, entries: u32) -> Result<Box<dyn IoDriver>> {
    match kind {
        DriverKind::IoUring => new_uring(entries),
        DriverKind::Poll => Ok(Box::new(PollDriver::new())),
        DriverKind::Auto => match new_uring(entries) {
            Ok(driver) => Ok(driver),
            Err(e) => {
                warn!(error = %e, "io_uring unavailable, falling back to poll driver");
                Ok(Box::new(PollDriver::new()))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{self, SockAddr};
    use std::net::{SocketAddr, TcpListener};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::io::Write;
    use std::time::{Duration, Instant};
    use tpc_core::io_driver::{IoCompletion, IoOp};

    /// Every backend available on this host.
    fn drivers() -> Vec<Box<dyn IoDriver>> {
        let mut v = vec![new_driver(DriverKind::Poll, 64).unwrap()];
        if let Ok(d) = new_driver(DriverKind::IoUring, 64) {
            v.push(d);
        }
        v
    }

    fn wait_one(d: &mut dyn IoDriver) -> IoCompletion {
        let mut out = Vec::new();
        while out.is_empty() {
            d.submit_and_wait(1).unwrap();
            d.drain(&mut out, 16);
        }
        assert_eq!(out.len(), 1);
        out[0]
    }

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("auto".parse::<DriverKind>().unwrap(), DriverKind::Auto);
        assert_eq!("IO_URING".parse::<DriverKind>().unwrap(), DriverKind::IoUring);
        assert_eq!(" poll ".parse::<DriverKind>().unwrap(), DriverKind::Poll);
        assert!("epoll".parse::<DriverKind>().is_err());
        assert_eq!(DriverKind::IoUring.to_string(), "io_uring");
    }

    #[test]
    fn test_auto_always_yields_a_driver() {
        let d = new_driver(DriverKind::Auto, 32).unwrap();
        assert!(matches!(d.name(), "io_uring" | "poll"));
        assert_eq!(d.inflight(), 0);
    }

    #[test]
    fn test_recv_send_roundtrip() {
        for mut d in drivers() {
            let (a, b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            let mut buf = vec![0u8; 64];
            unsafe {
                d.submit(7, IoOp::Recv { fd: a.as_raw_fd(), buf: buf.as_mut_ptr(), len: 64 })
                    .unwrap();
            }
            assert_eq!(d.inflight(), 1);
            d.submit_and_wait(0).unwrap();
            (&b).write_all(b"ping").unwrap();
            let c = wait_one(d.as_mut());
            assert_eq!(c, IoCompletion { token: 7, result: 4 }, "{}", d.name());
            assert_eq!(&buf[..4], b"ping");

            let msg = b"pong!";
            unsafe {
                d.submit(8, IoOp::Send { fd: a.as_raw_fd(), buf: msg.as_ptr(), len: 5 })
                    .unwrap();
            }
            let c = wait_one(d.as_mut());
            assert_eq!(c, IoCompletion { token: 8, result: 5 });
            assert_eq!(d.inflight(), 0);
        }
    }

    #[test]
    fn test_timeout_and_cancel() {
        for mut d in drivers() {
            let start = Instant::now();
            unsafe {
                d.submit(1, IoOp::Timeout { after: Duration::from_millis(30) }).unwrap();
            }
            let c = wait_one(d.as_mut());
            assert_eq!(c, IoCompletion { token: 1, result: 0 }, "{}", d.name());
            assert!(start.elapsed() >= Duration::from_millis(25));

            let (a, _b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            let mut buf = [0u8; 8];
            unsafe {
                d.submit(2, IoOp::Recv { fd: a.as_raw_fd(), buf: buf.as_mut_ptr(), len: 8 })
                    .unwrap();
            }
            d.submit_and_wait(0).unwrap();
            d.cancel(2).unwrap();
            let c = wait_one(d.as_mut());
            assert_eq!(c.token, 2);
            assert!(
                c.result == -libc::ECANCELED || c.result == -libc::EINTR,
                "{}: {}",
                d.name(),
                c.result
            );
        }
    }

    #[test]
    fn test_connect_and_accept() {
        for mut d in drivers() {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.set_nonblocking(true).unwrap();
            let target: SocketAddr = listener.local_addr().unwrap();

            unsafe {
                d.submit(10, IoOp::Accept { fd: listener.as_raw_fd() }).unwrap();
            }
            let fd = socket::stream_socket(&target).unwrap();
            let sa = SockAddr::from(target);
            unsafe {
                d.submit(11, IoOp::Connect { fd, addr: sa.as_ptr(), addr_len: sa.len() })
                    .unwrap();
            }

            let mut out = Vec::new();
            while out.len() < 2 {
                d.submit_and_wait(1).unwrap();
                d.drain(&mut out, 16);
            }
            out.sort_by_key(|c| c.token);
            assert!(out[0].result >= 0, "accept failed on {}: {}", d.name(), out[0].result);
            assert_eq!(out[1], IoCompletion { token: 11, result: 0 });
            socket::close(out[0].result);
            socket::close(fd);
        }
    }

    #[test]
    fn test_connect_refused() {
        for mut d in drivers() {
            // Bind then drop to get a port with nobody listening.
            let target = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
            let fd = socket::stream_socket(&target).unwrap();
            let sa = SockAddr::from(target);
            unsafe {
                d.submit(3, IoOp::Connect { fd, addr: sa.as_ptr(), addr_len: sa.len() })
                    .unwrap();
            }
            let c = wait_one(d.as_mut());
            assert_eq!(c.result, -libc::ECONNREFUSED, "{}", d.name());
            socket::close(fd);
        }
    }
}
