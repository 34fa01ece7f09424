//! # Bounded Queue
//!
//! Closable fixed-capacity FIFO used between the loops of a connection.
//!
//! Capacity is tracked by two semaphores: `slots` counts free places,
//! `ready` counts queued items. A producer takes a slot permit and hands a
//! ready permit to consumers; a consumer does the reverse. Closing the queue
//! closes both semaphores, which wakes every waiter with
//! [`ConduitError::ConnectionClosing`].
//!
//! ## Semantics
//! - `try_*` never suspends: full or empty yields `WriteBlocking` / `ReadBlocking`
//! - `*_timeout` with a zero duration behaves like `try_*`
//! - `push` / `pop` wait until capacity / data is available or the queue closes
//!
//! ```rust
//! use tcp_conduit::core::queue::BoundedQueue;
//! use tcp_conduit::error::ConduitError;
//!
//! let queue = BoundedQueue::new(1);
//! queue.try_push("a").unwrap();
//! assert!(matches!(queue.try_push("b"), Err(ConduitError::WriteBlocking)));
//! assert_eq!(queue.try_pop().unwrap(), "a");
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::{ConduitError, Result};
use crate::utils::timeout::with_timeout_error;

/// Fixed-capacity FIFO with close semantics
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    slots: Semaphore,
    ready: Semaphore,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items, clamped to
    /// `1..=Semaphore::MAX_PERMITS`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            items: Mutex::new(VecDeque::new()),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Close the queue: pending and future operations fail, queued items are dropped.
    pub fn close(&self) {
        self.slots.close();
        self.ready.close();
        self.lock().clear();
    }

    /// Enqueue without waiting.
    pub fn try_push(&self, item: T) -> Result<()> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.commit_push(item)
            }
            Err(TryAcquireError::NoPermits) => Err(ConduitError::WriteBlocking),
            Err(TryAcquireError::Closed) => Err(ConduitError::ConnectionClosing),
        }
    }

    /// Enqueue, waiting for a free slot as long as necessary.
    pub async fn push(&self, item: T) -> Result<()> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| ConduitError::ConnectionClosing)?;
        permit.forget();
        self.commit_push(item)
    }

    /// Enqueue, waiting at most `timeout` for a free slot.
    pub async fn push_timeout(&self, item: T, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return self.try_push(item);
        }
        with_timeout_error(self.push(item), timeout, ConduitError::WriteBlocking).await
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Result<T> {
        match self.ready.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.commit_pop()
            }
            Err(TryAcquireError::NoPermits) => Err(ConduitError::ReadBlocking),
            Err(TryAcquireError::Closed) => Err(ConduitError::ConnectionClosing),
        }
    }

    /// Dequeue, waiting for an item as long as necessary.
    pub async fn pop(&self) -> Result<T> {
        let permit = self
            .ready
            .acquire()
            .await
            .map_err(|_| ConduitError::ConnectionClosing)?;
        permit.forget();
        self.commit_pop()
    }

    /// Dequeue, waiting at most `timeout` for an item.
    pub async fn pop_timeout(&self, timeout: Duration) -> Result<T> {
        if timeout.is_zero() {
            return self.try_pop();
        }
        with_timeout_error(self.pop(), timeout, ConduitError::ReadBlocking).await
    }

    fn commit_push(&self, item: T) -> Result<()> {
        {
            let mut items = self.lock();
            // close() may have run between acquiring the slot and taking the lock
            if self.is_closed() {
                return Err(ConduitError::ConnectionClosing);
            }
            items.push_back(item);
        }
        self.ready.add_permits(1);
        Ok(())
    }

    fn commit_pop(&self) -> Result<T> {
        let item = self
            .lock()
            .pop_front()
            .ok_or(ConduitError::ConnectionClosing)?;
        self.slots.add_permits(1);
        Ok(item)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
