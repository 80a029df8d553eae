use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded queue that never blocks producers: when full the oldest entry goes.
pub struct DropOldestQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes an item. Returns `Some(true)` when an old item was dropped to
    /// make room and `None` when the queue is closed.
    pub fn push(&self, item: T) -> Option<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return None;
        }
        let dropped = if state.items.len() >= self.capacity {
            state.items.pop_front();
            true
        } else {
            false
        };
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        Some(dropped)
    }

    /// Waits up to `timeout` for items and takes at most `max` of them.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub fn pop_batch(&self, max: usize, timeout: Duration) -> Option<Vec<T>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if state.items.is_empty() && state.closed {
            return None;
        }
        let n = state.items.len().min(max.max(1));
        Some(state.items.drain(..n).collect())
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
