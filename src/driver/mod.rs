//! The driver ties sockets, connection table, fragmenter and event queues together. All network
//!  I/O and all protocol state transitions that depend on the peer happen inside a tick, which
//!  is scheduled explicitly through [Driver::schedule_update]:
//!
//! 1. start a new receive epoch, invalidating read views and events of the previous tick
//! 2. drain the socket, routing each datagram through the connection table and fragmenter
//! 3. evaluate connect retries and idle timeouts
//! 4. publish the tick's events
//! 5. flush all queued outbound datagrams
//!
//! Events that were not popped before the next tick starts are discarded.

mod driver_state;
pub mod job_handle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use tokio::time::Instant;

use crate::buffers::read_view::ReadView;
use crate::buffers::write_buffer::WriteBuffer;
use crate::config::DriverConfig;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::driver::driver_state::{DriverState, PublishedTick};
use crate::driver::job_handle::JobHandle;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::event_queue::{Event, EventKind};
use crate::safe_converter::SafeCast;
use crate::socket::ipc::{IpcNetwork, IpcSocket};
use crate::socket::udp::UdpSocket;
use crate::socket::DatagramSocket;

/// An event popped from a driver. `connection` is `None` and `data` is `None` for
///  [EventKind::Empty]; `data` is present for [EventKind::Data] only.
#[derive(Debug, Clone)]
pub struct DriverEvent {
    pub kind: EventKind,
    pub connection: Option<ConnectionHandle>,
    pub data: Option<ReadView>,
}

impl DriverEvent {
    pub fn empty() -> DriverEvent {
        DriverEvent {
            kind: EventKind::Empty,
            connection: None,
            data: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == EventKind::Empty
    }
}

pub struct Driver<S: DatagramSocket> {
    config: Arc<DriverConfig>,
    state: Arc<Mutex<DriverState<S>>>,
    published: Arc<PublishedTick>,
    update_in_flight: Arc<AtomicBool>,
}

impl Driver<UdpSocket> {
    pub fn udp(config: DriverConfig) -> anyhow::Result<Driver<UdpSocket>> {
        let socket = UdpSocket::with_max_datagram_size(config.max_datagram_size);
        Driver::new(socket, config)
    }
}

impl Driver<IpcSocket> {
    pub fn ipc(network: &IpcNetwork, config: DriverConfig) -> anyhow::Result<Driver<IpcSocket>> {
        let socket = IpcSocket::with_max_datagram_size(network.clone(), config.max_datagram_size);
        Driver::new(socket, config)
    }
}

impl<S: DatagramSocket> Driver<S> {
    pub fn new(socket: S, config: DriverConfig) -> anyhow::Result<Driver<S>> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(Driver {
            state: Arc::new(Mutex::new(DriverState::new(socket, config.clone(), Instant::now()))),
            published: Arc::new(PublishedTick::new(&config)),
            update_in_flight: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn ensure_idle(&self) -> anyhow::Result<()> {
        if self.update_in_flight.load(Ordering::Acquire) {
            bail!(TransportError::UpdateInFlight);
        }
        Ok(())
    }

    /// access to the driver's state between ticks
    fn state(&self) -> anyhow::Result<MutexGuard<'_, DriverState<S>>> {
        self.ensure_idle()?;
        lock_state(&self.state)
    }

    pub fn bind(&self, endpoint: Endpoint) -> anyhow::Result<()> {
        self.state()?.bind(endpoint)
    }

    pub fn local_endpoint(&self) -> anyhow::Result<Option<Endpoint>> {
        Ok(self.state()?.local_endpoint())
    }

    /// Start accepting incoming connection requests. The driver must be bound.
    pub fn listen(&self) -> anyhow::Result<()> {
        self.state()?.listen()
    }

    pub fn is_listening(&self) -> anyhow::Result<bool> {
        Ok(self.state()?.is_listening())
    }

    /// Hand out the oldest connection that a peer requested, or `None` if there is none
    pub fn accept(&self) -> anyhow::Result<Option<ConnectionHandle>> {
        Ok(self.state()?.accept())
    }

    /// Start connecting to `remote`, binding to an arbitrary local endpoint first if the driver
    ///  is not bound yet. The connection is established when a `Connect` event for the returned
    ///  handle is popped.
    pub fn connect(&self, remote: Endpoint) -> anyhow::Result<ConnectionHandle> {
        self.state()?.connect(remote, Instant::now())
    }

    /// Queue the bytes written to `buf` for sending with the next tick, returning the number of
    ///  bytes queued: 0 for a handle that is stale or not connected.
    pub fn send(&self, handle: ConnectionHandle, buf: &WriteBuffer) -> anyhow::Result<usize> {
        self.state()?.send(handle, buf.as_ref())
    }

    /// Returns `false` if the handle was stale already
    pub fn disconnect(&self, handle: ConnectionHandle) -> anyhow::Result<bool> {
        self.state()?.disconnect(handle)
    }

    /// `Disconnected` for stale handles
    pub fn connection_state(&self, handle: ConnectionHandle) -> anyhow::Result<ConnectionState> {
        Ok(self.state()?.connection_state(handle))
    }

    pub fn remote_endpoint(&self, handle: ConnectionHandle) -> anyhow::Result<Option<Endpoint>> {
        Ok(self.state()?.remote_endpoint(handle))
    }

    /// The oldest event of the most recent tick that was not popped yet. Several threads can
    ///  pop concurrently.
    pub fn pop_event(&self) -> anyhow::Result<DriverEvent> {
        self.ensure_idle()?;
        let event = self.published.events.pop_event();
        self.to_driver_event(event)
    }

    /// The oldest unpopped event of the most recent tick for exactly `handle`
    pub fn pop_event_for_connection(&self, handle: ConnectionHandle) -> anyhow::Result<DriverEvent> {
        self.ensure_idle()?;
        let event = self.published.events.pop_event_for_connection(handle);
        self.to_driver_event(event)
    }

    fn to_driver_event(&self, event: Option<Event>) -> anyhow::Result<DriverEvent> {
        let Some(event) = event else {
            return Ok(DriverEvent::empty());
        };

        let data = if event.kind == EventKind::Data {
            let (arena_epoch, arena) = self.published.arena()?;
            if arena_epoch != event.epoch {
                // a tick ran between claiming the event and reading the arena
                bail!(TransportError::StaleReadView { view_epoch: event.epoch, current_epoch: arena_epoch });
            }
            let offset: usize = event.offset.safe_cast();
            let size: usize = event.size.safe_cast();
            if offset + size > arena.len() {
                bail!("data event exceeds the receive arena");
            }
            Some(ReadView::for_epoch(arena, offset, size, &self.published.epoch, event.epoch))
        }
        else {
            None
        };

        Ok(DriverEvent {
            kind: event.kind,
            connection: Some(event.connection),
            data,
        })
    }

    /// Schedule one tick, to run after `dependency` completed. The driver is unusable until the
    ///  returned job is completed; scheduling another tick before that fails.
    pub fn schedule_update(&self, dependency: Option<JobHandle>) -> anyhow::Result<JobHandle> {
        if self.update_in_flight.swap(true, Ordering::AcqRel) {
            bail!(TransportError::UpdateInFlight);
        }

        let state = self.state.clone();
        let published = self.published.clone();
        let task = tokio::spawn(async move {
            if let Some(dependency) = dependency {
                dependency.complete().await?;
            }
            let mut state = lock_state(&state)?;
            state.update(Instant::now(), &published)
        });

        Ok(JobHandle::for_update(task, self.update_in_flight.clone()))
    }
}

fn lock_state<S: DatagramSocket>(state: &Mutex<DriverState<S>>) -> anyhow::Result<MutexGuard<'_, DriverState<S>>> {
    state.lock()
        .map_err(|_| anyhow!("driver state lock is poisoned"))
}
