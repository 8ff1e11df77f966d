use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::DriverConfig;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::endpoint::Endpoint;
use crate::fragmenter::Fragmenter;
use crate::safe_converter::PrecheckedCast;

pub struct ConnectionSlot {
    generation: u32,
    pub state: ConnectionState,
    pub remote_endpoint: Option<Endpoint>,
    /// number of ConnectionRequests sent so far, for slots in state `Connecting`
    pub attempt_count: u32,
    pub last_send_time: Instant,
    pub last_receive_time: Instant,
    /// server side: the application took this connection through `accept()`. Client side
    ///  connections are accepted from the start.
    pub accepted: bool,
    /// reassembly of fragmented payloads received on this connection
    pub fragmenter: Fragmenter,
}

impl ConnectionSlot {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    fn is_live(&self) -> bool {
        matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// The outcome of evaluating a slot's timers, for the driver to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    /// the attempt count was incremented already
    ResendConnectionRequest { handle: ConnectionHandle, remote: Endpoint },
    /// all connect attempts are used up; the slot is still allocated
    ConnectFailed { handle: ConnectionHandle },
    /// nothing was received for longer than the disconnect timeout; the slot is still allocated
    IdleTimeout { handle: ConnectionHandle },
}

/// Fixed-size pool of connection slots, addressed through generation tagged handles.
pub struct ConnectionTable {
    slots: Vec<ConnectionSlot>,
    /// FIFO reuse, so a recycled index is picked as late as possible
    free_list: VecDeque<u32>,
    by_endpoint: FxHashMap<Endpoint, u32>,
}

impl ConnectionTable {
    pub fn new(config: &DriverConfig, now: Instant) -> ConnectionTable {
        let slots = (0..config.max_connections)
            .map(|_| ConnectionSlot {
                generation: 0,
                state: ConnectionState::Disconnected,
                remote_endpoint: None,
                attempt_count: 0,
                last_send_time: now,
                last_receive_time: now,
                accepted: false,
                fragmenter: Fragmenter::new(config.fragment_size(), config.max_message_size, config.max_reassemblies_per_connection),
            })
            .collect();

        ConnectionTable {
            slots,
            free_list: (0..config.max_connections).map(|i| i.prechecked_cast()).collect(),
            by_endpoint: FxHashMap::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    /// Take a free slot for a connection to `remote`, or `None` if the pool is exhausted.
    ///
    /// NB: The caller ensures that there is no live connection to `remote` yet
    pub fn allocate(&mut self, remote: Endpoint, state: ConnectionState, now: Instant) -> Option<ConnectionHandle> {
        debug_assert!(!self.by_endpoint.contains_key(&remote));

        let index = self.free_list.pop_front()?;
        let slot = &mut self.slots[index as usize];
        slot.state = state;
        slot.remote_endpoint = Some(remote);
        slot.attempt_count = 0;
        slot.last_send_time = now;
        slot.last_receive_time = now;
        slot.accepted = false;
        slot.fragmenter.clear();

        self.by_endpoint.insert(remote, index);
        let handle = ConnectionHandle::new(index, slot.generation);
        trace!("allocated slot {} for {} in state {:?}", handle, remote, state);
        Some(handle)
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&ConnectionSlot> {
        self.slots.get(handle.index())
            .filter(|slot| slot.generation == handle.generation() && slot.is_live())
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut ConnectionSlot> {
        self.slots.get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation() && slot.is_live())
    }

    pub fn state(&self, handle: ConnectionHandle) -> ConnectionState {
        self.get(handle)
            .map(|slot| slot.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn find_by_endpoint(&self, remote: &Endpoint) -> Option<ConnectionHandle> {
        let &index = self.by_endpoint.get(remote)?;
        let slot = &self.slots[index as usize];
        slot.is_live()
            .then(|| ConnectionHandle::new(index, slot.generation))
    }

    /// handles of all connecting or connected slots
    pub fn live_handles(&self) -> Vec<ConnectionHandle> {
        self.slots.iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_live())
            .map(|(i, slot)| ConnectionHandle::new(i.prechecked_cast(), slot.generation))
            .collect()
    }

    /// Invalidate `handle` right away, but keep the slot reserved in state `Disconnecting` until
    ///  [Self::release] is called. Returns the remote endpoint, or `None` for a stale handle.
    pub fn begin_disconnect(&mut self, handle: ConnectionHandle) -> Option<Endpoint> {
        let slot = self.get_mut(handle)?;
        let remote = slot.remote_endpoint;
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = ConnectionState::Disconnecting;
        slot.fragmenter.clear();

        if let Some(remote) = &remote {
            self.by_endpoint.remove(remote);
        }
        debug!("slot {} is disconnecting", handle);
        remote
    }

    /// Recycle a live slot immediately. Returns false for a stale handle.
    pub fn free(&mut self, handle: ConnectionHandle) -> bool {
        if self.get(handle).is_none() {
            return false;
        }
        self.release(handle.index());
        true
    }

    /// Return the slot at `index` to the free list, invalidating all handles to it. Releasing a
    ///  slot that is free already has no effect.
    pub fn release(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        match slot.state {
            ConnectionState::Disconnected => return,
            ConnectionState::Disconnecting => {}
            ConnectionState::Connecting | ConnectionState::Connected => {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }

        let slot_index: u32 = index.prechecked_cast();
        if let Some(remote) = slot.remote_endpoint.take() {
            if self.by_endpoint.get(&remote) == Some(&slot_index) {
                self.by_endpoint.remove(&remote);
            }
        }
        slot.state = ConnectionState::Disconnected;
        slot.accepted = false;
        slot.fragmenter.clear();
        self.free_list.push_back(slot_index);
        trace!("released slot {}", index);
    }

    /// Check connect retries and idle timeouts of all live slots
    pub fn evaluate_timers(&mut self, now: Instant, config: &DriverConfig) -> Vec<TimerAction> {
        let mut actions = Vec::new();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let handle = ConnectionHandle::new(index.prechecked_cast(), slot.generation);
            match slot.state {
                ConnectionState::Connecting => {
                    if now.saturating_duration_since(slot.last_send_time) < config.connect_timeout {
                        continue;
                    }
                    if slot.attempt_count < config.max_connect_attempts {
                        slot.attempt_count += 1;
                        slot.last_send_time = now;
                        if let Some(remote) = slot.remote_endpoint {
                            actions.push(TimerAction::ResendConnectionRequest { handle, remote });
                        }
                    }
                    else {
                        actions.push(TimerAction::ConnectFailed { handle });
                    }
                }
                ConnectionState::Connected => {
                    if now.saturating_duration_since(slot.last_receive_time) > config.disconnect_timeout {
                        actions.push(TimerAction::IdleTimeout { handle });
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
            }
        }

        actions
    }
}
