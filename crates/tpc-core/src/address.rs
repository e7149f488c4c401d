//! Member addressing.
//!
//! A member is identified by the address of its first reactor. Reactor `i`
//! of that member listens on `port + i`, so a peer's full endpoint set is
//! derived from one address and the reactor count.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(SocketAddr);

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Listening endpoint of reactor `index` on this member.
    ///
    /// Returns `None` if the port would overflow.
    pub fn reactor_endpoint(&self, index: usize) -> Option<SocketAddr> {
        let offset = u16::try_from(index).ok()?;
        let port = self.0.port().checked_add(offset)?;
        Some(SocketAddr::new(self.0.ip(), port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
