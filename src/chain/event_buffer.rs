use std::{cmp::Reverse, collections::BinaryHeap};

use parking_lot::Mutex;

use super::{ChainError, ChainEvent, ChainPosition};

struct Pending {
    position: ChainPosition,
    event: ChainEvent,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.position.cmp(&other.position)
    }
}

/// Holds back chain events until the chain head is `confirmation_depth`
/// blocks past them.
///
/// Block callbacks and log callbacks may run concurrently, hence the lock.
pub struct EventBuffer {
    confirmation_depth: u64,
    capacity: usize,
    pending: Mutex<BinaryHeap<Reverse<Pending>>>,
}

impl EventBuffer {
    pub fn new(confirmation_depth: u64, capacity: usize) -> Self {
        Self {
            confirmation_depth,
            capacity,
            pending: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn push(&self, event: ChainEvent) -> Result<(), ChainError> {
        self.push_all(vec![event])
    }

    /// Buffer all of `events` or, if they do not fit, none of them.
    pub fn push_all(&self, events: Vec<ChainEvent>) -> Result<(), ChainError> {
        let mut pending = self.pending.lock();
        if pending.len() + events.len() > self.capacity {
            return Err(ChainError::BufferFull(pending.len()));
        }
        pending.extend(events.into_iter().map(|event| {
            Reverse(Pending {
                position: event.position(),
                event,
            })
        }));
        Ok(())
    }

    /// Remove and return all events confirmed at chain head `head`, oldest
    /// first.
    pub fn release(&self, head: u64) -> Vec<ChainEvent> {
        let mut pending = self.pending.lock();
        let mut released = Vec::new();
        while let Some(Reverse(next)) = pending.peek() {
            if next.position.block_num.saturating_add(self.confirmation_depth) > head {
                break;
            }
            if let Some(Reverse(p)) = pending.pop() {
                released.push(p.event);
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
