//! Events produced by a driver tick, poppable in two orders over the same backing log: driver
//!  wide in arrival order, and per connection. Popping an event through either order consumes
//!  it for both.

use std::collections::VecDeque;

use tracing::trace;

use crate::connection::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// the application called `disconnect()`
    Local,
    /// the peer sent a Disconnect message
    Remote,
    /// nothing was received for longer than the disconnect timeout
    Timeout,
    /// no Accept arrived within the configured number of connect attempts
    ConnectFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// there is no pending event
    Empty,
    Connect,
    Disconnect(DisconnectReason),
    Data,
}

/// `offset` and `size` locate a Data event's payload in the receive arena of the tick that
///  produced it. They are 0 for all other kinds. `epoch` is the receive epoch of that tick,
///  assigned when the event is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub connection: ConnectionHandle,
    pub offset: u32,
    pub size: u32,
    pub epoch: u64,
}

impl Event {
    pub fn connect(connection: ConnectionHandle) -> Event {
        Event { kind: EventKind::Connect, connection, offset: 0, size: 0, epoch: 0 }
    }

    pub fn disconnect(connection: ConnectionHandle, reason: DisconnectReason) -> Event {
        Event { kind: EventKind::Disconnect(reason), connection, offset: 0, size: 0, epoch: 0 }
    }

    pub fn data(connection: ConnectionHandle, offset: u32, size: u32) -> Event {
        Event { kind: EventKind::Data, connection, offset, size, epoch: 0 }
    }
}

struct Entry {
    event: Event,
    consumed: bool,
}

/// Single threaded event queue, used for staging events during a tick.
pub struct EventQueue {
    log: Vec<Entry>,
    /// everything before `head` is consumed
    head: usize,
    /// indices into `log` per connection slot; may contain consumed entries, which are skipped
    per_connection: Vec<VecDeque<usize>>,
    initial_capacity: usize,
    num_unconsumed: usize,
}

impl EventQueue {
    pub fn new(connection_capacity: usize, initial_per_connection_capacity: usize) -> EventQueue {
        EventQueue {
            log: Vec::new(),
            head: 0,
            per_connection: (0..connection_capacity)
                .map(|_| VecDeque::with_capacity(initial_per_connection_capacity))
                .collect(),
            initial_capacity: initial_per_connection_capacity,
            num_unconsumed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num_unconsumed
    }

    pub fn is_empty(&self) -> bool {
        self.num_unconsumed == 0
    }

    pub fn push_event(&mut self, event: Event) {
        let slot = event.connection.index();
        if slot >= self.per_connection.len() {
            let initial_capacity = self.initial_capacity;
            self.per_connection.resize_with(slot + 1, || VecDeque::with_capacity(initial_capacity));
        }

        trace!("event: {:?}", event);
        self.per_connection[slot].push_back(self.log.len());
        self.log.push(Entry { event, consumed: false });
        self.num_unconsumed += 1;
    }

    /// the oldest unconsumed event of any connection
    pub fn pop_event(&mut self) -> Option<Event> {
        while let Some(entry) = self.log.get_mut(self.head) {
            self.head += 1;
            if !entry.consumed {
                entry.consumed = true;
                self.num_unconsumed -= 1;
                return Some(entry.event);
            }
        }
        None
    }

    /// The oldest unconsumed event carrying exactly `connection`. Events of other generations
    ///  of the same slot are left in place.
    pub fn pop_event_for_connection(&mut self, connection: ConnectionHandle) -> Option<Event> {
        let log = &mut self.log;
        let queue = self.per_connection.get_mut(connection.index())?;

        while queue.front().is_some_and(|&i| log[i].consumed) {
            queue.pop_front();
        }

        let position = queue.iter()
            .position(|&i| !log[i].consumed && log[i].event.connection == connection)?;
        let index = queue.remove(position)?;
        let entry = &mut log[index];
        entry.consumed = true;
        self.num_unconsumed -= 1;
        Some(entry.event)
    }

    /// Remove all unconsumed events in arrival order, leaving the queue empty
    pub fn drain(&mut self) -> impl Iterator<Item = Event> + '_ {
        for queue in &mut self.per_connection {
            queue.clear();
        }
        self.head = 0;
        self.num_unconsumed = 0;
        self.log.drain(..)
            .filter(|entry| !entry.consumed)
            .map(|entry| entry.event)
    }

    /// discard all events, keeping allocated capacity
    pub fn clear(&mut self) {
        self.log.clear();
        self.head = 0;
        self.num_unconsumed = 0;
        for queue in &mut self.per_connection {
            queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn handle(index: u32) -> ConnectionHandle {
        ConnectionHandle::new(index, 0)
    }

    #[test]
    fn test_pop_in_arrival_order() {
        let mut queue = EventQueue::new(4, 2);
        queue.push_event(Event::connect(handle(1)));
        queue.push_event(Event::data(handle(2), 0, 5));
        queue.push_event(Event::disconnect(handle(1), DisconnectReason::Remote));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop_event(), Some(Event::connect(handle(1))));
        assert_eq!(queue.pop_event(), Some(Event::data(handle(2), 0, 5)));
        assert_eq!(queue.pop_event(), Some(Event::disconnect(handle(1), DisconnectReason::Remote)));
        assert_eq!(queue.pop_event(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_per_connection_grows_beyond_initial_capacity() {
        let mut queue = EventQueue::new(1, 1);
        for i in 0..16 {
            queue.push_event(Event::data(handle(0), i * 10, 10));
        }
        for i in 0..16 {
            assert_eq!(queue.pop_event_for_connection(handle(0)), Some(Event::data(handle(0), i * 10, 10)));
        }
        assert_eq!(queue.pop_event_for_connection(handle(0)), None);
        assert_eq!(queue.pop_event(), None);
    }

    #[test]
    fn test_slot_beyond_capacity() {
        let mut queue = EventQueue::new(1, 1);
        queue.push_event(Event::connect(handle(5)));
        assert_eq!(queue.pop_event_for_connection(handle(5)), Some(Event::connect(handle(5))));
        assert_eq!(queue.pop_event_for_connection(handle(9)), None);
    }

    #[rstest]
    #[case::connection_first(true)]
    #[case::driver_first(false)]
    fn test_interleaved_pops_consume_each_event_once(#[case] connection_first: bool) {
        let mut queue = EventQueue::new(2, 1);
        queue.push_event(Event::connect(handle(0)));
        queue.push_event(Event::connect(handle(1)));
        queue.push_event(Event::data(handle(0), 0, 1));
        queue.push_event(Event::data(handle(1), 1, 1));

        let mut popped = Vec::new();
        if connection_first {
            popped.extend(queue.pop_event_for_connection(handle(1)));
            popped.extend(queue.pop_event());
            popped.extend(queue.pop_event_for_connection(handle(1)));
        }
        else {
            popped.extend(queue.pop_event());
            popped.extend(queue.pop_event());
            popped.extend(queue.pop_event_for_connection(handle(0)));
        }
        while let Some(event) = queue.pop_event() {
            popped.push(event);
        }

        assert_eq!(popped.len(), 4);
        for event in [Event::connect(handle(0)), Event::connect(handle(1)), Event::data(handle(0), 0, 1), Event::data(handle(1), 1, 1)] {
            assert_eq!(popped.iter().filter(|&&e| e == event).count(), 1);
        }
        assert_eq!(queue.pop_event_for_connection(handle(0)), None);
        assert_eq!(queue.pop_event_for_connection(handle(1)), None);
    }

    #[test]
    fn test_generations_are_distinguished() {
        let old = ConnectionHandle::new(0, 0);
        let new = ConnectionHandle::new(0, 1);
        let mut queue = EventQueue::new(1, 4);
        queue.push_event(Event::disconnect(old, DisconnectReason::Timeout));
        queue.push_event(Event::connect(new));

        assert_eq!(queue.pop_event_for_connection(new), Some(Event::connect(new)));
        assert_eq!(queue.pop_event_for_connection(new), None);
        assert_eq!(queue.pop_event_for_connection(old), Some(Event::disconnect(old, DisconnectReason::Timeout)));
    }

    #[test]
    fn test_drain_skips_consumed() {
        let mut queue = EventQueue::new(2, 1);
        queue.push_event(Event::connect(handle(0)));
        queue.push_event(Event::connect(handle(1)));
        queue.push_event(Event::data(handle(0), 0, 1));
        queue.pop_event_for_connection(handle(1));

        let drained: Vec<_> = queue.drain().collect();
        assert_eq!(drained, vec![Event::connect(handle(0)), Event::data(handle(0), 0, 1)]);
        assert!(queue.is_empty());
        assert_eq!(queue.pop_event_for_connection(handle(0)), None);
    }

    #[test]
    fn test_clear() {
        let mut queue = EventQueue::new(1, 1);
        queue.push_event(Event::connect(handle(0)));
        queue.clear();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.pop_event(), None);
        assert_eq!(queue.pop_event_for_connection(handle(0)), None);

        queue.push_event(Event::data(handle(0), 0, 3));
        assert_eq!(queue.pop_event(), Some(Event::data(handle(0), 0, 3)));
    }
}
