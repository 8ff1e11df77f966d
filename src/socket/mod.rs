//! The socket capability the driver is generic over. There are two implementations with
//!  identical semantics: [udp::UdpSocket] for real networking and [ipc::IpcSocket], an
//!  in-process loopback for deterministic tests.

#[cfg(test)] use mockall::automock;

use crate::endpoint::Endpoint;

pub mod ipc;
pub mod udp;

/// Non-blocking datagram I/O bound to one [Endpoint].
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + 'static {
    /// Bind to `endpoint`. A port of 0 lets the socket pick one, see [Self::local_endpoint].
    fn bind(&mut self, endpoint: Endpoint) -> anyhow::Result<()>;

    /// the actual endpoint after binding, `None` before
    fn local_endpoint(&self) -> Option<Endpoint>;

    /// Send a single datagram, returning the number of bytes sent. Delivery is not guaranteed,
    ///  sending to an endpoint nobody listens on is not an error.
    fn send_message(&self, to: Endpoint, packet_buf: &[u8]) -> anyhow::Result<usize>;

    /// Receive the next pending datagram into `buf`, returning its length and sender, or `None`
    ///  if no datagram is pending. Datagrams longer than `buf` are truncated.
    fn receive_message(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, Endpoint)>>;
}
