//! Rendezvous point: the synchronization object behind one directional link.
//!
//! A point holds at most one parked message (the current sender's) and at
//! most one active receiver. Further senders and receivers queue on the
//! condition variable until the slot, or the receiver turn, frees up.
//! Closing wakes everyone; a parked message that was not yet picked up is
//! withdrawn and its sender sees `ClosedChannel`.

use crate::{reclaim, LinkError, LinkMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

static NEXT_POINT_ID: AtomicU64 = AtomicU64::new(1);

struct Parked {
    ticket: u64,
    message: LinkMessage,
}

struct PointState {
    closed: bool,
    slot: Option<Parked>,
    receiver_active: bool,
    next_ticket: u64,
}

/// Shared synchronization object pairing one sender with one receiver
pub struct RendezvousPoint {
    id: u64,
    state: Mutex<PointState>,
    changed: Condvar,
}

impl RendezvousPoint {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_POINT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PointState {
                closed: false,
                slot: None,
                receiver_active: false,
                next_ticket: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// Returns the point's identity. Never zero.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closes the point and wakes every blocked thread
    ///
    /// Returns true if this call performed the close.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        self.changed.notify_all();
        true
    }

    /// Parks `message` and blocks until a receiver takes it
    pub(crate) fn send(&self, message: LinkMessage) -> Result<(), LinkError> {
        let mut state = self.lock();

        // Wait for the slot; senders never interleave.
        loop {
            if state.closed {
                return Err(LinkError::ClosedChannel);
            }
            if state.slot.is_none() {
                break;
            }
            state = self.wait(state, None);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.slot = Some(Parked { ticket, message });
        self.changed.notify_all();

        loop {
            let still_parked = matches!(&state.slot, Some(parked) if parked.ticket == ticket);
            if !still_parked {
                trace!(point = self.id, ticket, "message handed off");
                return Ok(());
            }
            if state.closed {
                state.slot = None;
                self.changed.notify_all();
                return Err(LinkError::ClosedChannel);
            }
            state = self.wait(state, None);
        }
    }

    /// Blocks until a parked message is available and takes it
    ///
    /// A `None` or zero timeout waits indefinitely.
    pub(crate) fn receive(&self, timeout: Option<Duration>) -> Result<LinkMessage, LinkError> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        let mut state = self.lock();

        // One receiver at a time.
        loop {
            if state.closed {
                return Err(LinkError::ClosedChannel);
            }
            if !state.receiver_active {
                break;
            }
            if expired(deadline) {
                return Err(LinkError::TimedOut);
            }
            state = self.wait(state, deadline);
        }

        state.receiver_active = true;
        let result = loop {
            if state.closed {
                break Err(LinkError::ClosedChannel);
            }
            if let Some(parked) = state.slot.take() {
                break Ok(parked.message);
            }
            if expired(deadline) {
                break Err(LinkError::TimedOut);
            }
            state = self.wait(state, deadline);
        };
        state.receiver_active = false;
        self.changed.notify_all();
        result
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, PointState>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, PointState> {
        match deadline {
            None => self
                .changed
                .wait(guard)
                .unwrap_or_else(|p| p.into_inner()),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.changed
                    .wait_timeout(guard, remaining)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|p| p.into_inner().0)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PointState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

impl Drop for RendezvousPoint {
    fn drop(&mut self) {
        trace!(point = self.id, "rendezvous point reclaimed");
        reclaim::record(self.id);
    }
}
