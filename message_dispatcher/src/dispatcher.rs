//! Per-message-type fan-out.
//!
//! Every message type is in one of three states: unregistered, registered
//! for direct use (the caller polls with `wait_for_message`), or registered
//! for handlers (a dedicated dispatch loop receives and fans out). The two
//! registration modes exclude each other per type.
//!
//! Dispatch loops are created lazily on the first handler for a type and
//! are not torn down when the last handler is cancelled: the loop goes idle
//! and is reused by the next handler registration. Idle loops keep their
//! thread until the dispatcher shuts down.

use crate::mailbox::{Mailbox, ReceiveQueueFactory};
use crate::queue::{QueueError, ReceiveQueue};
use crate::{DispatchError, DispatcherConfig, Envelope, HandlerError};
use isolate::Isolate;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Callback invoked for every message of a registered type
///
/// Handlers run on the type's dispatch loop thread, one after another in
/// registration order. Returning an error or panicking is logged and does
/// not affect the other handlers.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle_message(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HandlerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
enum RegistrationKind {
    Direct,
    Handler(HandlerId),
}

/// Token returned by a registration, used to cancel exactly that registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    message_type: String,
    kind: RegistrationKind,
}

impl Registration {
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn is_direct(&self) -> bool {
        self.kind == RegistrationKind::Direct
    }
}

type HandlerList = Vec<(HandlerId, Arc<dyn MessageHandler>)>;

struct DispatchLoop {
    message_type: String,
    handlers: Mutex<HandlerList>,
    changed: Condvar,
}

impl DispatchLoop {
    fn new(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_string(),
            handlers: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandlerList> {
        self.handlers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn add(&self, id: HandlerId, handler: Arc<dyn MessageHandler>) {
        self.lock().push((id, handler));
        self.changed.notify_all();
    }

    /// Removes a handler; returns whether it was present
    fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn snapshot(&self) -> HandlerList {
        self.lock().clone()
    }

    fn wake(&self) {
        self.changed.notify_all();
    }

    fn run(&self, queue: &ReceiveQueue, shutdown: &AtomicBool, poll: Duration) {
        debug!(message_type = %self.message_type, "dispatch loop started");
        while !shutdown.load(Ordering::Acquire) {
            {
                let handlers = self.lock();
                if handlers.is_empty() {
                    // Idle: leave the queue alone so direct waiters get the messages.
                    let _ = self.changed.wait_timeout(handlers, poll);
                    continue;
                }
            }

            match queue.receive(Some(poll)) {
                Ok(envelope) => {
                    let handlers = self.snapshot();
                    if handlers.is_empty() {
                        queue.requeue_front(envelope);
                        continue;
                    }
                    self.dispatch(&handlers, &envelope);
                }
                Err(QueueError::TimedOut) | Err(QueueError::Full) => {}
                Err(QueueError::Closed) => break,
            }
        }
        debug!(message_type = %self.message_type, "dispatch loop stopped");
    }

    fn dispatch(&self, handlers: &HandlerList, envelope: &Envelope) {
        for (id, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_message(envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    message_type = %self.message_type,
                    message = %envelope.id,
                    handler = id.0,
                    error = %e,
                    "message handler failed"
                ),
                Err(_) => error!(
                    message_type = %self.message_type,
                    message = %envelope.id,
                    handler = id.0,
                    "message handler panicked"
                ),
            }
        }
    }
}

enum TypeState {
    Direct,
    Handlers(Arc<DispatchLoop>),
}

struct DispatcherState {
    types: HashMap<String, TypeState>,
    idle_loops: HashMap<String, Arc<DispatchLoop>>,
    threads: Vec<JoinHandle<()>>,
}

/// Routes messages by type to direct waiters or handler sets
pub struct MessageDispatcher {
    owner: Isolate,
    queues: Arc<dyn ReceiveQueueFactory>,
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
    shutdown: Arc<AtomicBool>,
    next_handler_id: AtomicU64,
}

impl MessageDispatcher {
    /// Creates a dispatcher whose loops run in the calling thread's isolate
    pub fn new(queues: Arc<dyn ReceiveQueueFactory>, config: DispatcherConfig) -> Self {
        Self {
            owner: Isolate::current(),
            queues,
            config,
            state: Mutex::new(DispatcherState {
                types: HashMap::new(),
                idle_loops: HashMap::new(),
                threads: Vec::new(),
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_handler_id: AtomicU64::new(0),
        }
    }

    /// Creates a dispatcher fed by `mailbox`
    pub fn with_mailbox(mailbox: &Mailbox, config: DispatcherConfig) -> Self {
        Self::new(Arc::new(mailbox.clone()), config)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Marks `message_type` for direct use
    ///
    /// Fails with `TypeConflict` if the type has handlers or is already in
    /// direct use.
    pub fn register_direct(&self, message_type: &str) -> Result<Registration, DispatchError> {
        let mut state = self.lock()?;
        match state.types.get(message_type) {
            Some(TypeState::Handlers(_)) => {
                return Err(conflict(message_type, "already registered for handlers"))
            }
            Some(TypeState::Direct) => return Err(conflict(message_type, "already in direct use")),
            None => {}
        }

        // Reserve the queue now so messages arriving before the first wait are kept.
        let _ = self.queues.queue_for(message_type);
        state
            .types
            .insert(message_type.to_string(), TypeState::Direct);
        debug!(message_type, "registered for direct use");

        Ok(Registration {
            message_type: message_type.to_string(),
            kind: RegistrationKind::Direct,
        })
    }

    /// Waits for the next message of a direct-registered type
    ///
    /// A `None` or zero timeout waits indefinitely.
    pub fn wait_for_message(
        &self,
        message_type: &str,
        timeout: Option<Duration>,
    ) -> Result<Envelope, DispatchError> {
        let queue = {
            let state = self.lock()?;
            match state.types.get(message_type) {
                Some(TypeState::Direct) => self.queues.queue_for(message_type),
                Some(TypeState::Handlers(_)) => {
                    return Err(conflict(message_type, "already registered for handlers"))
                }
                None => return Err(conflict(message_type, "not registered for direct use")),
            }
        };

        queue.receive(timeout).map_err(|e| match e {
            QueueError::TimedOut => DispatchError::TimedOut,
            QueueError::Closed | QueueError::Full => DispatchError::Closed,
        })
    }

    /// Adds `handler` to the handler set for `message_type`
    ///
    /// The first handler for a type starts its dispatch loop; later handlers
    /// share it. Fails with `TypeConflict` if the type is in direct use.
    pub fn register_handler<H>(
        &self,
        message_type: &str,
        handler: H,
    ) -> Result<Registration, DispatchError>
    where
        H: MessageHandler + 'static,
    {
        let mut state = self.lock()?;
        let dispatch_loop = match state.types.get(message_type) {
            Some(TypeState::Direct) => return Err(conflict(message_type, "already in direct use")),
            Some(TypeState::Handlers(existing)) => Arc::clone(existing),
            None => {
                let dispatch_loop = match state.idle_loops.remove(message_type) {
                    Some(idle) => idle,
                    None => {
                        let fresh = Arc::new(DispatchLoop::new(message_type));
                        let thread = self.spawn_loop(Arc::clone(&fresh))?;
                        state.threads.push(thread);
                        fresh
                    }
                };
                state.types.insert(
                    message_type.to_string(),
                    TypeState::Handlers(Arc::clone(&dispatch_loop)),
                );
                dispatch_loop
            }
        };

        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        dispatch_loop.add(id, Arc::new(handler));
        debug!(message_type, handler = id.0, "handler registered");

        Ok(Registration {
            message_type: message_type.to_string(),
            kind: RegistrationKind::Handler(id),
        })
    }

    /// Reverses exactly the registration `registration` was issued for
    pub fn cancel_registration(&self, registration: &Registration) -> Result<(), DispatchError> {
        let mut state = self.lock()?;
        let message_type = registration.message_type();
        let unknown = || DispatchError::UnknownRegistration(message_type.to_string());

        match (&registration.kind, state.types.get(message_type)) {
            (RegistrationKind::Direct, Some(TypeState::Direct)) => {
                state.types.remove(message_type);
            }
            (RegistrationKind::Handler(id), Some(TypeState::Handlers(dispatch_loop))) => {
                let dispatch_loop = Arc::clone(dispatch_loop);
                if !dispatch_loop.remove(*id) {
                    return Err(unknown());
                }
                if dispatch_loop.is_empty() {
                    // The loop is kept alive, idle, for the next registration.
                    state.types.remove(message_type);
                    state
                        .idle_loops
                        .insert(message_type.to_string(), dispatch_loop);
                }
            }
            _ => return Err(unknown()),
        }

        debug!(message_type, "registration cancelled");
        Ok(())
    }

    /// Number of handlers currently registered for `message_type`
    pub fn handler_count(&self, message_type: &str) -> usize {
        match self.lock() {
            Ok(state) => match state.types.get(message_type) {
                Some(TypeState::Handlers(dispatch_loop)) => dispatch_loop.len(),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    /// Number of dispatch loop threads started so far, idle ones included
    pub fn dispatch_loop_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .threads
            .len()
    }

    /// Stops every dispatch loop and rejects further registrations
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let threads = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            for type_state in state.types.values() {
                if let TypeState::Handlers(dispatch_loop) = type_state {
                    dispatch_loop.wake();
                }
            }
            for dispatch_loop in state.idle_loops.values() {
                dispatch_loop.wake();
            }
            std::mem::take(&mut state.threads)
        };

        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() != current {
                let _ = thread.join();
            }
        }
        debug!("dispatcher shut down");
    }

    fn spawn_loop(&self, dispatch_loop: Arc<DispatchLoop>) -> Result<JoinHandle<()>, DispatchError> {
        let queue = self.queues.queue_for(&dispatch_loop.message_type);
        let shutdown = Arc::clone(&self.shutdown);
        let poll = self.config.poll_interval();
        let name = format!("dispatch:{}", dispatch_loop.message_type);

        self.owner
            .spawn(name, move || dispatch_loop.run(&queue, &shutdown, poll))
            .map_err(|e| DispatchError::SpawnFailed(e.to_string()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, DispatcherState>, DispatchError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }
        Ok(self.state.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn conflict(message_type: &str, reason: &'static str) -> DispatchError {
    DispatchError::TypeConflict {
        message_type: message_type.to_string(),
        reason,
    }
}
