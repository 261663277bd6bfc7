//! Keyed event queue between an informer and its single consumer.
//!
//! The queue never blocks the informer: a push for a key that already has a
//! pending event replaces that event in place (latest value wins, original
//! position kept). A slow consumer therefore sees a coalesced, current view
//! rather than a backlog, which is what a level-triggered controller wants.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<T> {
    order: VecDeque<String>,
    pending: HashMap<String, T>,
    closed: bool,
}

#[derive(Clone)]
pub struct EventQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
    notify: Arc<Notify>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                order: VecDeque::new(),
                pending: HashMap::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue an event for `key`, coalescing with any pending one.
    ///
    /// Returns `Err` if the queue has been closed.
    pub fn push(&self, key: impl Into<String>, item: T) -> Result<(), T> {
        let key = key.into();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(item);
        }
        if inner.pending.insert(key.clone(), item).is_none() {
            inner.order.push_back(key);
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the oldest pending event, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Fast path: try to pop without waiting
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.order.pop_front() {
                    let item = inner.pending.remove(&key);
                    debug_assert!(item.is_some(), "order/pending out of sync");
                    if let Some(item) = item {
                        return Some(item);
                    }
                }
                if inner.closed {
                    return None;
                }
            }
            // Wait for notification
            self.notify.notified().await;
        }
    }

    /// Close the queue, preventing new pushes and waking all waiting poppers.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
