use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::bail;

use crate::error::TransportError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    /// in-process loopback, see [crate::socket::ipc]
    Ipc,
}

/// A transport address. For [AddressFamily::Ipc], `address` is unused (always unspecified) and
///  `port` is the id assigned by the IPC network's registry.
///
/// Port 0 means 'any port' for both families when binding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    family: AddressFamily,
    address: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    pub fn ipv4(address: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint { family: AddressFamily::Ipv4, address, port }
    }

    pub fn loopback_ipv4(port: u16) -> Endpoint {
        Endpoint::ipv4(Ipv4Addr::LOCALHOST, port)
    }

    pub fn ipc(port: u16) -> Endpoint {
        Endpoint { family: AddressFamily::Ipc, address: Ipv4Addr::UNSPECIFIED, port }
    }

    /// the wildcard endpoint of a family, letting the socket choose address and port
    pub fn any(family: AddressFamily) -> Endpoint {
        match family {
            AddressFamily::Ipv4 => Endpoint::ipv4(Ipv4Addr::UNSPECIFIED, 0),
            AddressFamily::Ipc => Endpoint::ipc(0),
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_any_port(&self) -> bool {
        self.port == 0
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.family {
            AddressFamily::Ipv4 => write!(f, "{}:{}", self.address, self.port),
            AddressFamily::Ipc => write!(f, "ipc:{}", self.port),
        }
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(value: SocketAddrV4) -> Self {
        Endpoint::ipv4(*value.ip(), value.port())
    }
}

impl TryFrom<SocketAddr> for Endpoint {
    type Error = anyhow::Error;

    fn try_from(value: SocketAddr) -> anyhow::Result<Self> {
        match value {
            SocketAddr::V4(addr) => Ok(addr.into()),
            SocketAddr::V6(addr) => bail!(TransportError::AddressFamily(format!("IPv6 address {} is not supported", addr))),
        }
    }
}

impl TryFrom<Endpoint> for SocketAddrV4 {
    type Error = anyhow::Error;

    fn try_from(value: Endpoint) -> anyhow::Result<Self> {
        match value.family {
            AddressFamily::Ipv4 => Ok(SocketAddrV4::new(value.address, value.port)),
            AddressFamily::Ipc => bail!(TransportError::AddressFamily(format!("{} has no socket address", value))),
        }
    }
}

impl TryFrom<Endpoint> for SocketAddr {
    type Error = anyhow::Error;

    fn try_from(value: Endpoint) -> anyhow::Result<Self> {
        Ok(SocketAddr::V4(value.try_into()?))
    }
}
