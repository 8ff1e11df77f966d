use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::buffers::buffer_pool::{BufferPool, PooledBuffer};
use crate::buffers::read_view::{Cursor, ReadView, ReceiveEpoch};
use crate::buffers::write_buffer::WriteBuffer;
use crate::concurrent_event_queue::ConcurrentEventQueue;
use crate::config::DriverConfig;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::connection_table::{ConnectionTable, TimerAction};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::event_queue::{DisconnectReason, Event, EventQueue};
use crate::fragmenter::Fragment;
use crate::message_header::DataHeader;
use crate::packet_header::{MessageType, PacketHeader};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::socket::DatagramSocket;

/// The results of the most recent tick, readable through `&Driver` until the next tick starts
pub(crate) struct PublishedTick {
    pub events: ConcurrentEventQueue,
    /// the receive arena together with the epoch it was filled in
    pub arena: RwLock<(u64, Bytes)>,
    pub epoch: ReceiveEpoch,
}

impl PublishedTick {
    pub fn new(config: &DriverConfig) -> PublishedTick {
        PublishedTick {
            events: ConcurrentEventQueue::new(config.max_connections, config.event_queue_initial_capacity),
            arena: RwLock::new((0, Bytes::new())),
            epoch: ReceiveEpoch::default(),
        }
    }

    fn set_arena(&self, epoch: u64, bytes: Bytes) -> anyhow::Result<()> {
        let mut arena = self.arena.write()
            .map_err(|_| anyhow!("receive arena lock is poisoned"))?;
        *arena = (epoch, bytes);
        Ok(())
    }

    pub fn arena(&self) -> anyhow::Result<(u64, Bytes)> {
        let arena = self.arena.read()
            .map_err(|_| anyhow!("receive arena lock is poisoned"))?;
        Ok(arena.clone())
    }
}

struct OutboundDatagram {
    to: Endpoint,
    connection: Option<ConnectionHandle>,
    /// the slot to recycle once this datagram is sent
    release_slot: Option<usize>,
    buf: PooledBuffer,
}

/// Everything a tick mutates. API calls between ticks mutate it too, ticks and API calls are
///  serialized by the driver.
pub(crate) struct DriverState<S: DatagramSocket> {
    config: Arc<DriverConfig>,
    socket: S,
    listening: bool,
    connections: ConnectionTable,
    /// server side slots that are reserved for a connection request, oldest first
    pending_accepts: VecDeque<ConnectionHandle>,
    staged_events: EventQueue,
    outbound: VecDeque<OutboundDatagram>,
    send_buffers: Arc<BufferPool>,
    receive_arena: WriteBuffer,
    receive_buf: Vec<u8>,
}

impl<S: DatagramSocket> DriverState<S> {
    pub fn new(socket: S, config: Arc<DriverConfig>, now: Instant) -> DriverState<S> {
        DriverState {
            socket,
            listening: false,
            connections: ConnectionTable::new(&config, now),
            pending_accepts: VecDeque::with_capacity(config.max_pending_accepts),
            staged_events: EventQueue::new(config.max_connections, config.event_queue_initial_capacity),
            outbound: VecDeque::new(),
            send_buffers: BufferPool::new(config.max_datagram_size, config.send_buffer_pool_size),
            receive_arena: WriteBuffer::new(config.receive_arena_size),
            receive_buf: vec![0; config.max_datagram_size],
            config,
        }
    }

    pub fn bind(&mut self, endpoint: Endpoint) -> anyhow::Result<()> {
        self.socket.bind(endpoint)
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.socket.local_endpoint()
    }

    pub fn listen(&mut self) -> anyhow::Result<()> {
        let Some(local_endpoint) = self.socket.local_endpoint() else {
            bail!(TransportError::NotBound);
        };
        info!("listening for connections on {}", local_endpoint);
        self.listening = true;
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        while let Some(handle) = self.pending_accepts.pop_front() {
            if let Some(slot) = self.connections.get_mut(handle) {
                slot.accepted = true;
                debug!("accepted connection {} from {:?}", handle, slot.remote_endpoint);
                return Some(handle);
            }
        }
        None
    }

    pub fn connect(&mut self, remote: Endpoint, now: Instant) -> anyhow::Result<ConnectionHandle> {
        if self.socket.local_endpoint().is_none() {
            self.socket.bind(Endpoint::any(remote.family()))?;
        }

        if let Some(existing) = self.connections.find_by_endpoint(&remote) {
            debug!("connect: there is a connection to {} already - returning it", remote);
            return Ok(existing);
        }

        let Some(handle) = self.connections.allocate(remote, ConnectionState::Connecting, now) else {
            bail!(TransportError::ConnectionPoolExhausted(self.connections.capacity()));
        };
        if let Some(slot) = self.connections.get_mut(handle) {
            slot.attempt_count = 1;
            slot.accepted = true;
        }
        debug!("connecting to {} as {}", remote, handle);

        if let Err(e) = self.queue_control_message(remote, MessageType::ConnectionRequest, Some(handle), None) {
            self.connections.free(handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub fn connection_state(&self, handle: ConnectionHandle) -> ConnectionState {
        self.connections.state(handle)
    }

    pub fn remote_endpoint(&self, handle: ConnectionHandle) -> Option<Endpoint> {
        self.connections.get(handle)
            .and_then(|slot| slot.remote_endpoint)
    }

    /// Queue `payload` for sending, returning the number of payload bytes queued. Returns 0 if
    ///  the handle is stale or the connection is not established yet.
    pub fn send(&mut self, handle: ConnectionHandle, payload: &[u8]) -> anyhow::Result<usize> {
        if payload.len() > self.config.max_message_size {
            bail!("payload of {} bytes exceeds the maximum message size of {}", payload.len(), self.config.max_message_size);
        }

        let max_unfragmented_payload = self.config.max_unfragmented_payload();
        let Some(slot) = self.connections.get_mut(handle) else {
            debug!("send: stale connection handle {} - ignoring", handle);
            return Ok(0);
        };
        if slot.state != ConnectionState::Connected {
            debug!("send: connection {} is {:?} - ignoring", handle, slot.state);
            return Ok(0);
        }
        let Some(remote) = slot.remote_endpoint else {
            return Ok(0);
        };

        if payload.len() <= max_unfragmented_payload {
            let mut buf = self.send_buffers.get_from_pool();
            PacketHeader::new(MessageType::Data).ser(&mut buf)?;
            DataHeader::for_payload(payload).ser(&mut buf)?;
            buf.write(payload)?;
            trace!("queued {} bytes for {}", payload.len(), handle);
            self.outbound.push_back(OutboundDatagram { to: remote, connection: Some(handle), release_slot: None, buf });
            return Ok(payload.len());
        }

        let id = slot.fragmenter.next_packet_id();
        let num_fragments = slot.fragmenter.fragment_packet(payload, id)?;
        let mut datagrams = Vec::with_capacity(num_fragments);
        while let Some(fragment) = slot.fragmenter.pop_outgoing() {
            let mut buf = self.send_buffers.get_from_pool();
            let serialized = PacketHeader::new(MessageType::DataFragment).ser(&mut buf)
                .and_then(|_| fragment.ser(&mut buf));
            if let Err(e) = serialized {
                // no fragment of this payload is sent
                slot.fragmenter.discard_outgoing();
                return Err(e);
            }
            datagrams.push(OutboundDatagram { to: remote, connection: Some(handle), release_slot: None, buf });
        }
        self.outbound.extend(datagrams);
        trace!("queued {} bytes for {} in {} fragments", payload.len(), handle, num_fragments);
        Ok(payload.len())
    }

    /// Invalidate `handle` and queue a Disconnect message for the peer. The slot is recycled
    ///  after the message is sent.
    pub fn disconnect(&mut self, handle: ConnectionHandle) -> anyhow::Result<bool> {
        let accepted = self.connections.get(handle)
            .is_some_and(|slot| slot.accepted);
        let Some(remote) = self.connections.begin_disconnect(handle) else {
            return Ok(false);
        };
        self.pending_accepts.retain(|&h| h != handle);

        debug!("disconnecting {} from {}", handle, remote);
        if let Err(e) = self.queue_control_message(remote, MessageType::Disconnect, None, Some(handle.index())) {
            self.connections.release(handle.index());
            return Err(e);
        }
        if accepted {
            self.staged_events.push_event(Event::disconnect(handle, DisconnectReason::Local));
        }
        Ok(true)
    }

    /// One protocol tick
    pub fn update(&mut self, now: Instant, published: &PublishedTick) -> anyhow::Result<()> {
        let epoch = published.epoch.advance();
        trace!("starting tick for receive epoch {}", epoch);
        published.events.clear();
        published.set_arena(epoch, Bytes::new())?;
        self.receive_arena.clear();

        self.receive_datagrams(now);
        self.evaluate_timers(now);

        published.set_arena(epoch, self.receive_arena.freeze())?;
        published.events.publish(&mut self.staged_events, epoch);

        self.flush(now);
        Ok(())
    }

    fn receive_datagrams(&mut self, now: Instant) {
        if self.socket.local_endpoint().is_none() {
            return;
        }

        loop {
            match self.socket.receive_message(&mut self.receive_buf) {
                Ok(Some((len, from))) => {
                    let datagram = ReadView::from_bytes(Bytes::copy_from_slice(&self.receive_buf[..len]));
                    self.on_datagram(now, from, &datagram);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("socket error while receiving: {}", e);
                    break;
                }
            }
        }
    }

    fn on_datagram(&mut self, now: Instant, from: Endpoint, datagram: &ReadView) {
        let mut cursor = Cursor::new();
        let header = match PacketHeader::deser(datagram, &mut cursor) {
            Ok(header) => header,
            Err(e) => {
                debug!("received datagram with unparsable header from {}: {} - dropping", from, e);
                return;
            }
        };
        trace!("received {:?} message from {} ({} bytes)", header.message_type, from, datagram.len());

        let result = match header.message_type {
            MessageType::ConnectionRequest => self.on_connection_request(now, from),
            MessageType::Accept => self.on_accept(now, from),
            MessageType::Disconnect => self.on_disconnect(from),
            MessageType::Data => self.on_data(now, from, datagram, &mut cursor),
            MessageType::DataFragment => self.on_data_fragment(now, from, datagram, &mut cursor),
        };
        if let Err(e) = result {
            warn!("received malformed {:?} message from {}: {} - dropping", header.message_type, from, e);
        }
    }

    fn on_connection_request(&mut self, now: Instant, from: Endpoint) -> anyhow::Result<()> {
        if let Some(handle) = self.connections.find_by_endpoint(&from) {
            let Some(slot) = self.connections.get_mut(handle) else {
                return Ok(());
            };
            if slot.state != ConnectionState::Connected {
                debug!("connection request from {} while connecting to it - ignoring", from);
                return Ok(());
            }
            slot.last_receive_time = now;
            debug!("repeated connection request from {} - re-sending accept", from);
            return self.queue_control_message(from, MessageType::Accept, Some(handle), None);
        }

        if !self.listening {
            debug!("connection request from {} while not listening - dropping", from);
            return Ok(());
        }
        if self.pending_accepts.len() >= self.config.max_pending_accepts {
            debug!("too many pending accepts - dropping connection request from {}", from);
            return Ok(());
        }
        let Some(handle) = self.connections.allocate(from, ConnectionState::Connected, now) else {
            debug!("connection pool exhausted - dropping connection request from {}", from);
            return Ok(());
        };

        debug!("reserved {} for connection request from {}", handle, from);
        self.pending_accepts.push_back(handle);
        self.queue_control_message(from, MessageType::Accept, Some(handle), None)
    }

    fn on_accept(&mut self, now: Instant, from: Endpoint) -> anyhow::Result<()> {
        let Some(handle) = self.connections.find_by_endpoint(&from) else {
            debug!("accept from unknown endpoint {} - dropping", from);
            return Ok(());
        };
        let Some(slot) = self.connections.get_mut(handle) else {
            return Ok(());
        };

        slot.last_receive_time = now;
        if slot.state == ConnectionState::Connecting {
            slot.state = ConnectionState::Connected;
            debug!("connection {} to {} is established", handle, from);
            self.staged_events.push_event(Event::connect(handle));
        }
        Ok(())
    }

    fn on_disconnect(&mut self, from: Endpoint) -> anyhow::Result<()> {
        let Some(handle) = self.connections.find_by_endpoint(&from) else {
            trace!("disconnect from unknown endpoint {} - ignoring", from);
            return Ok(());
        };
        debug!("peer {} closed connection {}", from, handle);
        self.drop_connection(handle, DisconnectReason::Remote);
        Ok(())
    }

    /// the established connection to `from`, registering the receipt of a message
    fn receiving_connection(&mut self, now: Instant, from: Endpoint) -> Option<ConnectionHandle> {
        let handle = self.connections.find_by_endpoint(&from)?;
        let slot = self.connections.get_mut(handle)?;
        if slot.state != ConnectionState::Connected {
            return None;
        }
        slot.last_receive_time = now;
        Some(handle)
    }

    fn on_data(&mut self, now: Instant, from: Endpoint, datagram: &ReadView, cursor: &mut Cursor) -> anyhow::Result<()> {
        let Some(handle) = self.receiving_connection(now, from) else {
            debug!("data from {} without an established connection - dropping", from);
            return Ok(());
        };

        let header = DataHeader::deser(datagram, cursor)?;
        let payload_len: usize = header.payload_len.safe_cast();
        if payload_len != datagram.remaining(cursor) {
            bail!("length prefix {} does not match the remaining {} bytes", payload_len, datagram.remaining(cursor));
        }
        let payload = datagram.read_slice(cursor, payload_len)?;
        self.deliver(handle, &payload);
        Ok(())
    }

    fn on_data_fragment(&mut self, now: Instant, from: Endpoint, datagram: &ReadView, cursor: &mut Cursor) -> anyhow::Result<()> {
        let Some(handle) = self.receiving_connection(now, from) else {
            debug!("fragment from {} without an established connection - dropping", from);
            return Ok(());
        };

        let fragment = Fragment::deser(datagram, cursor)?;
        if datagram.remaining(cursor) != 0 {
            bail!("{} trailing bytes after fragment", datagram.remaining(cursor));
        }

        let Some(slot) = self.connections.get_mut(handle) else {
            return Ok(());
        };
        if let Some(payload) = slot.fragmenter.defragment_packet(fragment)? {
            self.deliver(handle, &payload);
        }
        Ok(())
    }

    fn deliver(&mut self, handle: ConnectionHandle, payload: &[u8]) {
        let offset = self.receive_arena.len();
        if let Err(e) = self.receive_arena.write(payload) {
            debug!("receive arena is full, dropping {} bytes for {}: {}", payload.len(), handle, e);
            return;
        }
        trace!("received {} bytes for {}", payload.len(), handle);
        self.staged_events.push_event(Event::data(handle, offset.prechecked_cast(), payload.len().prechecked_cast()));
    }

    fn evaluate_timers(&mut self, now: Instant) {
        for action in self.connections.evaluate_timers(now, &self.config) {
            match action {
                TimerAction::ResendConnectionRequest { handle, remote } => {
                    debug!("re-sending connection request for {} to {}", handle, remote);
                    if let Err(e) = self.queue_control_message(remote, MessageType::ConnectionRequest, Some(handle), None) {
                        warn!("failed to re-send connection request for {}: {}", handle, e);
                    }
                }
                TimerAction::ConnectFailed { handle } => {
                    debug!("giving up connection attempt {} after {} attempts", handle, self.config.max_connect_attempts);
                    self.drop_connection(handle, DisconnectReason::ConnectFailed);
                }
                TimerAction::IdleTimeout { handle } => {
                    debug!("connection {} timed out", handle);
                    self.drop_connection(handle, DisconnectReason::Timeout);
                }
            }
        }
    }

    /// Recycle the slot without notifying the peer. Only connections the application knows
    ///  about produce an event.
    fn drop_connection(&mut self, handle: ConnectionHandle, reason: DisconnectReason) {
        let accepted = self.connections.get(handle)
            .is_some_and(|slot| slot.accepted);
        self.pending_accepts.retain(|&h| h != handle);
        if !self.connections.free(handle) {
            return;
        }

        if accepted {
            self.staged_events.push_event(Event::disconnect(handle, reason));
        }
        else {
            debug!("dropped connection {} before it was accepted", handle);
        }
    }

    fn queue_control_message(&mut self, to: Endpoint, message_type: MessageType, connection: Option<ConnectionHandle>, release_slot: Option<usize>) -> anyhow::Result<()> {
        let mut buf = self.send_buffers.get_from_pool();
        PacketHeader::new(message_type).ser(&mut buf)?;
        self.outbound.push_back(OutboundDatagram { to, connection, release_slot, buf });
        Ok(())
    }

    fn flush(&mut self, now: Instant) {
        while let Some(datagram) = self.outbound.pop_front() {
            match self.socket.send_message(datagram.to, datagram.buf.as_ref()) {
                Ok(len) => trace!("sent {} bytes to {}", len, datagram.to),
                Err(e) => warn!("failed to send datagram to {}: {}", datagram.to, e),
            }

            if let Some(slot) = datagram.connection.and_then(|handle| self.connections.get_mut(handle)) {
                slot.last_send_time = now;
            }
            if let Some(index) = datagram.release_slot {
                self.connections.release(index);
            }
        }
    }

    #[cfg(test)]
    pub fn num_outbound(&self) -> usize {
        self.outbound.len()
    }
}
