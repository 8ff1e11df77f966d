use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::connection::ConnectionHandle;
use crate::event_queue::{Event, EventQueue};

struct LogEntry {
    event: Event,
    claimed: AtomicBool,
}

impl LogEntry {
    /// true for exactly one caller
    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Log {
    entries: Vec<Arc<LogEntry>>,
    head: usize,
}

/// Thread safe counterpart of [EventQueue]: all operations work through `&self`, so several
///  workers can pop events for different connections in parallel. Each event is handed out
///  exactly once, regardless of which pop order claims it.
pub struct ConcurrentEventQueue {
    log: Mutex<Log>,
    per_connection: RwLock<Vec<Mutex<VecDeque<Arc<LogEntry>>>>>,
    initial_capacity: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // no invariant spans a critical section, so a poisoned lock is still consistent
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConcurrentEventQueue {
    pub fn new(connection_capacity: usize, initial_per_connection_capacity: usize) -> ConcurrentEventQueue {
        ConcurrentEventQueue {
            log: Mutex::new(Log::default()),
            per_connection: RwLock::new((0..connection_capacity)
                .map(|_| Mutex::new(VecDeque::with_capacity(initial_per_connection_capacity)))
                .collect()),
            initial_capacity: initial_per_connection_capacity,
        }
    }

    pub fn push_event(&self, event: Event) {
        let entry = Arc::new(LogEntry { event, claimed: AtomicBool::new(false) });
        let slot = event.connection.index();

        {
            let per_connection = self.per_connection.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = per_connection.get(slot) {
                lock(queue).push_back(entry.clone());
                lock(&self.log).entries.push(entry);
                return;
            }
        }

        let mut per_connection = self.per_connection.write().unwrap_or_else(PoisonError::into_inner);
        let initial_capacity = self.initial_capacity;
        if slot >= per_connection.len() {
            per_connection.resize_with(slot + 1, || Mutex::new(VecDeque::with_capacity(initial_capacity)));
        }
        lock(&per_connection[slot]).push_back(entry.clone());
        lock(&self.log).entries.push(entry);
    }

    /// Move all unconsumed events from `staged` over, preserving their arrival order and
    ///  tagging them with the receive `epoch` they belong to
    pub fn publish(&self, staged: &mut EventQueue, epoch: u64) {
        for mut event in staged.drain() {
            event.epoch = epoch;
            self.push_event(event);
        }
    }

    pub fn pop_event(&self) -> Option<Event> {
        let mut log = lock(&self.log);
        while log.head < log.entries.len() {
            let head = log.head;
            log.head += 1;
            let entry = &log.entries[head];
            if entry.claim() {
                return Some(entry.event);
            }
        }
        None
    }

    pub fn pop_event_for_connection(&self, connection: ConnectionHandle) -> Option<Event> {
        let per_connection = self.per_connection.read().unwrap_or_else(PoisonError::into_inner);
        let mut queue = lock(per_connection.get(connection.index())?);

        while queue.front().is_some_and(|entry| entry.is_claimed()) {
            queue.pop_front();
        }

        let mut position = 0;
        while position < queue.len() {
            let entry = &queue[position];
            if entry.event.connection != connection {
                position += 1;
                continue;
            }
            let claimed = entry.claim();
            let event = entry.event;
            // claimed now or concurrently through the driver wide order: either way it is done
            queue.remove(position);
            if claimed {
                return Some(event);
            }
        }
        None
    }

    /// number of events that were not claimed yet
    pub fn len(&self) -> usize {
        let log = lock(&self.log);
        log.entries[log.head..].iter()
            .filter(|entry| !entry.is_claimed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let per_connection = self.per_connection.read().unwrap_or_else(PoisonError::into_inner);
        for queue in per_connection.iter() {
            lock(queue).clear();
        }
        let mut log = lock(&self.log);
        log.entries.clear();
        log.head = 0;
    }
}
