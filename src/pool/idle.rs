//! Blocking bounded hand-off queue for idle connections.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub(crate) struct IdleQueue<T> {
    items: Mutex<VecDeque<T>>,
    changed: Condvar,
    capacity: usize,
}

impl<T> IdleQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            changed: Condvar::new(),
            capacity,
        }
    }

    /// Hand an item to one waiter or park it. Gives it back when full.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.changed.notify_one();
        Ok(())
    }

    pub(crate) fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait up to `timeout` for an item. Returns early with `None` when
    /// [`notify`](Self::notify) signals that a connection slot was freed.
    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.changed.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
            if items.is_empty() {
                return None;
            }
        }
    }

    /// Wake one waiter without handing over an item.
    pub(crate) fn notify(&self) {
        self.changed.notify_one();
    }

    pub(crate) fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        self.changed.notify_all();
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }
}
