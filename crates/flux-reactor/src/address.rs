use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// An IPv4 or IPv6 endpoint, wrapping [`std::net::SocketAddr`].
///
/// Kept as a thin newtype rather than using `SocketAddr` directly everywhere
/// so connection naming (`ip:port#n`) has one place to format consistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(SocketAddr);

impl Address {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    #[must_use]
    pub fn loopback(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    #[must_use]
    pub fn any(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| Error::BadAddress(s.to_owned()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
