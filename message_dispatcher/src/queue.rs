//! Bounded blocking receive queue, one per message type.
//!
//! Provides FIFO ordering with explicit capacity limits. Receivers block
//! until a message arrives, the timeout expires, or the queue is closed.

use crate::Envelope;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Queue error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full,
    Closed,
    TimedOut,
}

struct QueueState {
    messages: VecDeque<Envelope>,
    closed: bool,
}

/// Bounded FIFO queue of envelopes for a single message type.
pub struct ReceiveQueue {
    message_type: String,
    capacity: usize,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ReceiveQueue {
    /// Creates a queue with the specified capacity.
    pub fn with_capacity(message_type: impl Into<String>, capacity: usize) -> Self {
        Self {
            message_type: message_type.into(),
            capacity,
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Returns the message type this queue carries.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of queued messages.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Returns remaining capacity.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Pushes a message onto the back of the queue.
    pub fn push(&self, message: Envelope) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.messages.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        state.messages.push_back(message);
        self.available.notify_one();
        Ok(())
    }

    /// Returns a message to the front of the queue, ignoring capacity.
    ///
    /// Used when a consumer took a message it can no longer deliver.
    pub(crate) fn requeue_front(&self, message: Envelope) {
        let mut state = self.lock();
        state.messages.push_front(message);
        self.available.notify_one();
    }

    /// Pops the next message without blocking.
    pub fn try_receive(&self) -> Option<Envelope> {
        self.lock().messages.pop_front()
    }

    /// Blocks until a message is available.
    ///
    /// A `None` or zero timeout waits indefinitely.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Envelope, QueueError> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if let Some(message) = state.messages.pop_front() {
                return Ok(message);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::TimedOut);
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|p| p.into_inner().0)
                }
            };
        }
    }

    /// Closes the queue. Queued messages can still be drained.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.available.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
