//! Nonblocking TCP socket helpers.
//!
//! Every descriptor created here is `O_NONBLOCK | O_CLOEXEC`; the reactor
//! drives it exclusively through its `IoDriver`.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use tracing::debug;

/// Per-socket options applied to accepted and connected channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub tcp_nodelay: bool,
    pub keep_alive: bool,
    /// `SO_SNDBUF`; kernel default when `None`.
    pub send_buffer: Option<usize>,
    /// `SO_RCVBUF`; kernel default when `None`.
    pub recv_buffer: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keep_alive: true,
            send_buffer: None,
            recv_buffer: None,
        }
    }
}

/// A `sockaddr_storage` with its length, stable in memory for as long as
/// the value lives. Connect submissions point into it.
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        Self {
            storage,
            len: len as libc::socklen_t,
        }
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(drop)
}

/// New nonblocking stream socket for `addr`'s family.
pub fn stream_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    cvt(unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })
}

pub fn apply_options(fd: RawFd, opts: &SocketOptions) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, opts.tcp_nodelay as libc::c_int)?;
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, opts.keep_alive as libc::c_int)?;
    if let Some(size) = opts.send_buffer {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, clamp_int(size))?;
    }
    if let Some(size) = opts.recv_buffer {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, clamp_int(size))?;
    }
    Ok(())
}

fn clamp_int(v: usize) -> libc::c_int {
    v.min(libc::c_int::MAX as usize) as libc::c_int
}

/// Bind and listen on exactly `addr`. `SO_REUSEADDR` only, so a port held
/// by another live listener fails with `AddrInUse`.
pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let fd = stream_socket(&addr)?;
    let sa = SockAddr::from(addr);
    let result = setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
        .and_then(|_| cvt(unsafe { libc::bind(fd, sa.as_ptr(), sa.len()) }))
        .and_then(|_| cvt(unsafe { libc::listen(fd, backlog) }));
    match result {
        Ok(_) => Ok(fd),
        Err(e) => {
            close(fd);
            Err(e)
        }
    }
}

/// Bind `count` listeners on consecutive ports `base..base + count`.
///
/// Candidate bases start at `port_start` and advance by `count` whenever any
/// port of the group is taken, until the group no longer fits below
/// `port_end` (inclusive). Returns the chosen base and the descriptors in
/// port order.
pub fn listen_group(
    host: IpAddr,
    port_start: u16,
    port_end: u16,
    count: usize,
    backlog: i32,
) -> io::Result<(u16, Vec<RawFd>)> {
    let count32 = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
    let mut base = u32::from(port_start);
    let mut last_err = None;

    while base + count32 - 1 <= u32::from(port_end) {
        let mut fds = Vec::with_capacity(count);
        let mut failure = None;
        for i in 0..count32 {
            let addr = SocketAddr::new(host, (base + i) as u16);
            match listen(addr, backlog) {
                Ok(fd) => fds.push(fd),
                Err(e) => {
                    failure = Some((addr, e));
                    break;
                }
            }
        }

        let Some((addr, err)) = failure else {
            return Ok((base as u16, fds));
        };
        fds.into_iter().for_each(close);
        let retryable = matches!(
            err.kind(),
            io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
        );
        if !retryable {
            return Err(err);
        }
        debug!(%addr, error = %err, "port taken, trying next group");
        last_err = Some(err);
        base += count32;
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "port range too small")
    }))
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    sockname(fd, libc::getsockname)
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    sockname(fd, libc::getpeername)
}

fn sockname(
    fd: RawFd,
    f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
) -> io::Result<SocketAddr> {
    let mut sa = SockAddr {
        storage: unsafe { mem::zeroed() },
        len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
    };
    cvt(unsafe {
        f(
            fd,
            &mut sa.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut sa.len,
        )
    })?;
    sa.to_socket_addr()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
}

/// Pending socket error (`SO_ERROR`), 0 if none.
pub fn take_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(err)
}

/// Shut down both directions so in-flight reads and writes complete.
pub fn shutdown(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

pub fn close(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::os::unix::io::AsRawFd;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_sockaddr_roundtrip() {
        for addr in ["127.0.0.1:11000", "[::1]:9000"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let sa = SockAddr::from(addr);
            assert!(!sa.is_empty());
            assert_eq!(sa.to_socket_addr(), Some(addr));
        }
    }

    #[test]
    fn test_listen_and_options() {
        let fd = listen(SocketAddr::new(LOCALHOST, 0), 16).unwrap();
        let bound = local_addr(fd).unwrap();
        assert_ne!(bound.port(), 0);

        let client = TcpStream::connect(bound).unwrap();
        let opts = SocketOptions {
            send_buffer: Some(64 * 1024),
            recv_buffer: Some(64 * 1024),
            ..SocketOptions::default()
        };
        apply_options(client.as_raw_fd(), &opts).unwrap();
        assert_eq!(take_error(client.as_raw_fd()).unwrap(), 0);
        assert_eq!(peer_addr(client.as_raw_fd()).unwrap(), bound);
        close(fd);
    }

    #[test]
    fn test_listen_group_skips_taken_ports() {
        // Find a free pair, then occupy its first port.
        let (base, fds) = listen_group(LOCALHOST, 23100, 23199, 2, 16).unwrap();
        fds.into_iter().for_each(close);
        let blocker = listen(SocketAddr::new(LOCALHOST, base), 16).unwrap();

        let (next, fds) = listen_group(LOCALHOST, base, 23199, 2, 16).unwrap();
        assert!(next >= base + 2);
        assert_eq!((next - base) % 2, 0);
        assert_eq!(fds.len(), 2);
        assert_eq!(local_addr(fds[1]).unwrap().port(), next + 1);
        fds.into_iter().for_each(close);
        close(blocker);
    }

    #[test]
    fn test_listen_group_exhausted() {
        let blocker = listen(SocketAddr::new(LOCALHOST, 0), 16).unwrap();
        let port = local_addr(blocker).unwrap().port();
        let err = listen_group(LOCALHOST, port, port, 1, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        close(blocker);
    }
}
