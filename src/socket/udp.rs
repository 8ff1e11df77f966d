use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4};

use anyhow::{anyhow, bail};
use tracing::{info, trace};

use crate::endpoint::{AddressFamily, Endpoint};
use crate::error::TransportError;
use crate::socket::DatagramSocket;

/// UDP over IPv4. The underlying socket is non-blocking, so draining it inside a tick never
///  waits for the network.
pub struct UdpSocket {
    socket: Option<std::net::UdpSocket>,
    local_endpoint: Option<Endpoint>,
    max_datagram_size: usize,
}

impl Default for UdpSocket {
    fn default() -> Self {
        UdpSocket::with_max_datagram_size(Self::MAX_IPV4_PAYLOAD)
    }
}

impl UdpSocket {
    /// 65535 minus the IPv4 and UDP headers
    pub const MAX_IPV4_PAYLOAD: usize = 65507;

    pub fn new() -> UdpSocket {
        UdpSocket::default()
    }

    pub fn with_max_datagram_size(max_datagram_size: usize) -> UdpSocket {
        UdpSocket {
            socket: None,
            local_endpoint: None,
            max_datagram_size,
        }
    }

    fn socket(&self) -> anyhow::Result<&std::net::UdpSocket> {
        self.socket.as_ref()
            .ok_or_else(|| anyhow!(TransportError::NotBound))
    }
}

impl DatagramSocket for UdpSocket {
    fn bind(&mut self, endpoint: Endpoint) -> anyhow::Result<()> {
        if endpoint.family() != AddressFamily::Ipv4 {
            bail!(TransportError::AddressFamily(format!("cannot bind a UDP socket to {}", endpoint)));
        }

        let socket = std::net::UdpSocket::bind(SocketAddrV4::try_from(endpoint)?)?;
        socket.set_nonblocking(true)?;
        let local_endpoint = Endpoint::try_from(socket.local_addr()?)?;
        info!("bound UDP socket to {}", local_endpoint);

        self.socket = Some(socket);
        self.local_endpoint = Some(local_endpoint);
        Ok(())
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_endpoint
    }

    fn send_message(&self, to: Endpoint, packet_buf: &[u8]) -> anyhow::Result<usize> {
        if packet_buf.len() > self.max_datagram_size {
            bail!(TransportError::DatagramTooLarge { len: packet_buf.len(), max: self.max_datagram_size });
        }
        trace!("UDP socket: sending {} bytes to {}", packet_buf.len(), to);
        let to = SocketAddr::try_from(to)?;
        match self.socket()?.send_to(packet_buf, to) {
            Ok(n) => Ok(n),
            // the send buffer is full: for a datagram socket this is just another dropped packet
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn receive_message(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, Endpoint)>> {
        match self.socket()?.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, Endpoint::try_from(from)?))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
