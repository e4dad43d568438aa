//! Bounded FIFO work queue shared between async tasks.
//!
//! `put` waits while the queue is at capacity and `take` waits while it is
//! empty. A `put` that is waiting for room has handed its item to the queue
//! already: a concurrent `remove_value` can withdraw it, in which case the
//! `put` returns `false` and the item never becomes visible to `take`.
//! Either the item is enqueued and then removed, or it is not enqueued at all.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

struct QueueState<T> {
    items: VecDeque<T>,
    /// Items of `put` calls waiting for room, oldest first.
    waiting: VecDeque<(u64, T)>,
    next_ticket: u64,
}

/// Bounded, async, multi-producer multi-consumer FIFO.
pub struct WorkQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` items (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                waiting: VecDeque::new(),
                next_ticket: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Create a queue without a capacity limit.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn has_room(&self, st: &QueueState<T>) -> bool {
        self.capacity == 0 || st.items.len() < self.capacity
    }

    /// Append an item, waiting while the queue is full.
    ///
    /// Returns `false` if the item was withdrawn by [`remove_value`](Self::remove_value)
    /// or [`clear`](Self::clear) before room became available.
    pub async fn put(&self, item: T) -> bool {
        let ticket = {
            let mut st = self.lock();
            if st.waiting.is_empty() && self.has_room(&st) {
                st.items.push_back(item);
                drop(st);
                self.not_empty.notify_waiters();
                return true;
            }
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.waiting.push_back((ticket, item));
            ticket
        };

        let guard = WaitingPut { queue: self, ticket };
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.lock();
                match st.waiting.iter().position(|(t, _)| *t == ticket) {
                    None => return guard.withdrawn(),
                    // Only the oldest waiting put may enqueue, which keeps FIFO order.
                    Some(0) if self.has_room(&st) => {
                        if let Some((_, item)) = st.waiting.pop_front() {
                            st.items.push_back(item);
                        }
                        let more = !st.waiting.is_empty() && self.has_room(&st);
                        drop(st);
                        guard.enqueued();
                        self.not_empty.notify_waiters();
                        if more {
                            self.not_full.notify_waiters();
                        }
                        return true;
                    }
                    Some(_) => {}
                }
            }

            notified.await;
        }
    }

    /// Append an item if there is room right now. Returns the queue length
    /// before the item was added, or hands the item back when full.
    pub fn try_put(&self, item: T) -> Result<usize, T> {
        let prev = {
            let mut st = self.lock();
            if !st.waiting.is_empty() || !self.has_room(&st) {
                return Err(item);
            }
            let prev = st.items.len();
            st.items.push_back(item);
            prev
        };
        self.not_empty.notify_waiters();
        Ok(prev)
    }

    /// Remove and return the oldest item, waiting while the queue is empty.
    pub async fn take(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_take() {
                return item;
            }

            notified.await;
        }
    }

    /// Remove and return the oldest item without waiting.
    pub fn try_take(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_waiters();
        }
        item
    }

    /// Remove every item matching `pred`, including items of waiting `put`s.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        {
            let mut st = self.lock();
            let mut kept = VecDeque::with_capacity(st.items.len());
            for item in st.items.drain(..) {
                if pred(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            st.items = kept;

            let mut kept_waiting = VecDeque::with_capacity(st.waiting.len());
            for (ticket, item) in st.waiting.drain(..) {
                if pred(&item) {
                    removed.push(item);
                } else {
                    kept_waiting.push_back((ticket, item));
                }
            }
            st.waiting = kept_waiting;
        }
        if !removed.is_empty() {
            self.not_full.notify_waiters();
        }
        removed
    }

    /// Drop all items, including those of waiting `put`s.
    pub fn clear(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut st = self.lock();
            let mut all: Vec<T> = st.items.drain(..).collect();
            all.extend(st.waiting.drain(..).map(|(_, item)| item));
            all
        };
        self.not_full.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let st = self.lock();
        !self.has_room(&st)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: PartialEq> WorkQueue<T> {
    /// Remove one occurrence of `value`. Returns whether it was found, either
    /// enqueued or still held by a waiting `put`.
    pub fn remove_value(&self, value: &T) -> bool {
        let found = {
            let mut st = self.lock();
            if let Some(pos) = st.items.iter().position(|item| item == value) {
                st.items.remove(pos);
                true
            } else if let Some(pos) = st.waiting.iter().position(|(_, item)| item == value) {
                st.waiting.remove(pos);
                true
            } else {
                false
            }
        };
        if found {
            self.not_full.notify_waiters();
        }
        found
    }
}

/// Withdraws the item of a `put` that is dropped while waiting for room.
struct WaitingPut<'a, T> {
    queue: &'a WorkQueue<T>,
    ticket: u64,
}

impl<T> WaitingPut<'_, T> {
    fn enqueued(self) {
        std::mem::forget(self);
    }

    fn withdrawn(self) -> bool {
        std::mem::forget(self);
        false
    }
}

impl<T> Drop for WaitingPut<'_, T> {
    fn drop(&mut self) {
        let mut st = self.queue.lock();
        st.waiting.retain(|(t, _)| *t != self.ticket);
        drop(st);
        self.queue.not_full.notify_waiters();
    }
}
