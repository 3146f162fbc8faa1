//! Bounded blocking MPMC queue with close.
//!
//! The queue is the pipeline's overload protection: a slow consumer stalls
//! its producer's `push` instead of letting memory grow. `close` wakes every
//! blocked caller; consumers drain what is left and then see
//! [`DaqError::Closed`], which marks end of stream rather than failure.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{AppResult, DaqError};

/// Rejected push, returning the message to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue stayed full for the whole timeout
    Timeout(T),
    /// The queue is closed
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the rejected message.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Timeout(item) | PushError::Closed(item) => item,
        }
    }
}

impl<T> From<PushError<T>> for DaqError {
    fn from(value: PushError<T>) -> Self {
        match value {
            PushError::Timeout(_) => DaqError::Timeout,
            PushError::Closed(_) => DaqError::Closed,
        }
    }
}

/// Anything that can be closed to unblock its waiters.
///
/// Stage controllers hold their queues as `Arc<dyn Closable>` so `abort` can
/// close them without knowing the message type.
pub trait Closable: Send + Sync {
    /// Close and wake all waiters.
    fn close(&self);
    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    name: String,
}

/// Bounded FIFO queue. Clones share the same queue.
pub struct SyncQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for SyncQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SyncQueue")
            .field("name", &self.shared.name)
            .field("len", &state.items.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> SyncQueue<T> {
    /// Queue holding at most `capacity` messages (minimum 1).
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
                name: name.into(),
            }),
        }
    }

    /// Queue name used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// `None` waits until space frees up or the queue is closed.
    pub fn push(&self, item: T, timeout: Option<Duration>) -> Result<(), PushError<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() < self.shared.capacity {
                state.items.push_back(item);
                drop(state);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .not_full
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.items.len() >= self.shared.capacity
                        && !state.closed
                    {
                        return Err(PushError::Timeout(item));
                    }
                }
                None => self.shared.not_full.wait(&mut state),
            }
        }
    }

    /// Append `item` without blocking, evicting the oldest message if full.
    ///
    /// Returns the evicted message, if any.
    pub fn push_drop_oldest(&self, item: T) -> Result<Option<T>, PushError<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        let evicted = if state.items.len() >= self.shared.capacity {
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(evicted)
    }

    /// Remove the oldest message, blocking while the queue is empty.
    ///
    /// # Errors
    ///
    /// - [`DaqError::Timeout`] if nothing arrived within `timeout`
    /// - [`DaqError::Closed`] once the queue is closed and drained
    pub fn pop(&self, timeout: Option<Duration>) -> AppResult<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(DaqError::Closed);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .not_empty
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.items.is_empty()
                        && !state.closed
                    {
                        return Err(DaqError::Timeout);
                    }
                }
                None => self.shared.not_empty.wait(&mut state),
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.shared.state.lock().items.pop_front();
        if item.is_some() {
            self.shared.not_full.notify_one();
        }
        item
    }
}

impl<T: Send> Closable for SyncQueue<T> {
    fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        tracing::debug!(queue = %self.shared.name, "Queue closed");
    }

    fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}
