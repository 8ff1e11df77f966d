//! In-process loopback 'network'. All sockets created for one [IpcNetwork] can exchange
//!  datagrams; delivery is immediate and deterministic, which makes this the socket of choice
//!  for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::endpoint::{AddressFamily, Endpoint};
use crate::error::TransportError;
use crate::socket::DatagramSocket;

struct IpcRegistry {
    /// ports reserved for names, whether or not anyone is bound to them
    names: FxHashMap<String, u16>,
    mailboxes: FxHashMap<u16, VecDeque<(Endpoint, Vec<u8>)>>,
    next_port: u16,
    mailbox_capacity: usize,
}

impl IpcRegistry {
    fn is_reserved(&self, port: u16) -> bool {
        self.mailboxes.contains_key(&port) || self.names.values().any(|&p| p == port)
    }

    fn allocate_port(&mut self) -> anyhow::Result<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(1);
            if !self.is_reserved(candidate) {
                return Ok(candidate);
            }
        }
        bail!("no free IPC port left")
    }
}

/// Shared registry of IPC endpoints. Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct IpcNetwork {
    registry: Arc<Mutex<IpcRegistry>>,
}

impl Default for IpcNetwork {
    fn default() -> Self {
        IpcNetwork::new()
    }
}

impl IpcNetwork {
    pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

    pub fn new() -> IpcNetwork {
        IpcNetwork::with_mailbox_capacity(Self::DEFAULT_MAILBOX_CAPACITY)
    }

    /// `mailbox_capacity` is the number of datagrams a socket buffers before dropping new ones
    pub fn with_mailbox_capacity(mailbox_capacity: usize) -> IpcNetwork {
        IpcNetwork {
            registry: Arc::new(Mutex::new(IpcRegistry {
                names: FxHashMap::default(),
                mailboxes: FxHashMap::default(),
                next_port: 1,
                mailbox_capacity,
            })),
        }
    }

    fn registry(&self) -> anyhow::Result<MutexGuard<'_, IpcRegistry>> {
        self.registry.lock()
            .map_err(|_| anyhow!("IPC registry lock is poisoned"))
    }

    /// Resolve a name to an endpoint, reserving a port for the name on first use. Resolving the
    ///  same name again yields the same endpoint.
    pub fn resolve(&self, name: &str) -> anyhow::Result<Endpoint> {
        let mut registry = self.registry()?;
        if let Some(&port) = registry.names.get(name) {
            return Ok(Endpoint::ipc(port));
        }

        let port = registry.allocate_port()?;
        debug!("resolved IPC name {:?} to port {}", name, port);
        registry.names.insert(name.to_string(), port);
        Ok(Endpoint::ipc(port))
    }

    pub fn socket(&self) -> IpcSocket {
        IpcSocket::new(self.clone())
    }
}

pub struct IpcSocket {
    network: IpcNetwork,
    local_endpoint: Option<Endpoint>,
    max_datagram_size: usize,
}

impl IpcSocket {
    /// mirrors the largest UDP payload over IPv4
    pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65507;

    pub fn new(network: IpcNetwork) -> IpcSocket {
        IpcSocket::with_max_datagram_size(network, Self::DEFAULT_MAX_DATAGRAM_SIZE)
    }

    pub fn with_max_datagram_size(network: IpcNetwork, max_datagram_size: usize) -> IpcSocket {
        IpcSocket {
            network,
            local_endpoint: None,
            max_datagram_size,
        }
    }

    fn bound_endpoint(&self) -> anyhow::Result<Endpoint> {
        self.local_endpoint
            .ok_or_else(|| anyhow!(TransportError::NotBound))
    }
}

impl DatagramSocket for IpcSocket {
    fn bind(&mut self, endpoint: Endpoint) -> anyhow::Result<()> {
        if endpoint.family() != AddressFamily::Ipc {
            bail!(TransportError::AddressFamily(format!("cannot bind an IPC socket to {}", endpoint)));
        }

        let mut registry = self.network.registry()?;
        let port = if endpoint.is_any_port() {
            registry.allocate_port()?
        }
        else {
            endpoint.port()
        };
        if registry.mailboxes.contains_key(&port) {
            bail!(TransportError::AddressInUse(endpoint.to_string()));
        }

        if let Some(previous) = self.local_endpoint {
            registry.mailboxes.remove(&previous.port());
        }
        registry.mailboxes.insert(port, VecDeque::new());
        self.local_endpoint = Some(Endpoint::ipc(port));
        debug!("bound IPC socket to {}", Endpoint::ipc(port));
        Ok(())
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_endpoint
    }

    fn send_message(&self, to: Endpoint, packet_buf: &[u8]) -> anyhow::Result<usize> {
        let from = self.bound_endpoint()?;
        if to.family() != AddressFamily::Ipc {
            bail!(TransportError::AddressFamily(format!("cannot send from an IPC socket to {}", to)));
        }
        if packet_buf.len() > self.max_datagram_size {
            bail!(TransportError::DatagramTooLarge { len: packet_buf.len(), max: self.max_datagram_size });
        }

        let mut registry = self.network.registry()?;
        let mailbox_capacity = registry.mailbox_capacity;
        match registry.mailboxes.get_mut(&to.port()) {
            Some(mailbox) if mailbox.len() < mailbox_capacity => {
                trace!("IPC socket: sending {} bytes from {} to {}", packet_buf.len(), from, to);
                mailbox.push_back((from, packet_buf.to_vec()));
            }
            Some(_) => debug!("IPC mailbox of {} is full - dropping datagram", to),
            None => trace!("no IPC socket bound to {} - dropping datagram", to),
        }
        Ok(packet_buf.len())
    }

    fn receive_message(&self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, Endpoint)>> {
        let local = self.bound_endpoint()?;
        let mut registry = self.network.registry()?;

        let Some((from, datagram)) = registry.mailboxes.get_mut(&local.port()).and_then(|m| m.pop_front()) else {
            return Ok(None);
        };
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(Some((len, from)))
    }
}

impl Drop for IpcSocket {
    fn drop(&mut self) {
        if let Some(local) = self.local_endpoint {
            if let Ok(mut registry) = self.network.registry() {
                registry.mailboxes.remove(&local.port());
            }
        }
    }
}
