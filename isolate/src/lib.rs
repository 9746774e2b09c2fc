//! # Isolate
//!
//! This crate provides isolation contexts: the execution units between which
//! links carry messages.
//!
//! ## Philosophy
//!
//! - **Identity is explicit**: Every isolate has an [`IsolateId`] and a lifecycle state
//! - **No host runtime objects**: An isolate is a handle plus a state machine, nothing more
//! - **Threads belong to exactly one isolate**: The binding is what link access checks consult
//!
//! ## Core Concepts
//!
//! - `Isolate`: Cloneable handle to an isolation context
//! - `IsolateState`: `New → Started → Terminated`
//! - `IsolateGuard`: Scoped binding of the calling thread to an isolate
//!
//! Threads that were never bound run in the process-wide root isolate, which
//! is started on first use and never terminated.

use core_types::IsolateId;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::debug;

/// Lifecycle state of an isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolateState {
    /// Created but not yet started
    New,
    /// Running; links may be created to and from it
    Started,
    /// Exited; no new links may reference it
    Terminated,
}

impl fmt::Display for IsolateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolateState::New => write!(f, "new"),
            IsolateState::Started => write!(f, "started"),
            IsolateState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Isolate lifecycle errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IsolateError {
    #[error("Isolate {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: IsolateId,
        from: IsolateState,
        to: IsolateState,
    },

    #[error("Isolate {id} is not running (state: {state})")]
    NotRunning { id: IsolateId, state: IsolateState },

    #[error("Failed to spawn thread in {id}: {reason}")]
    SpawnFailed { id: IsolateId, reason: String },
}

struct IsolateInner {
    id: IsolateId,
    name: String,
    state: Mutex<IsolateState>,
}

/// Handle to an isolation context
///
/// Handles are cheap to clone; all clones observe the same lifecycle state.
/// Two handles are equal iff they name the same isolate.
#[derive(Clone)]
pub struct Isolate {
    inner: Arc<IsolateInner>,
}

thread_local! {
    static CURRENT: RefCell<Option<Isolate>> = const { RefCell::new(None) };
}

static ROOT: OnceLock<Isolate> = OnceLock::new();

impl Isolate {
    /// Creates a new isolate in the `New` state
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(IsolateInner {
                id: IsolateId::new(),
                name: name.into(),
                state: Mutex::new(IsolateState::New),
            }),
        }
    }

    /// Creates an isolate and starts it immediately
    pub fn started(name: impl Into<String>) -> Self {
        let isolate = Self::new(name);
        *isolate.lock_state() = IsolateState::Started;
        isolate
    }

    /// Returns the process-wide root isolate
    pub fn root() -> Isolate {
        ROOT.get_or_init(|| Isolate::started("root")).clone()
    }

    /// Returns the isolate the calling thread is bound to
    ///
    /// Unbound threads run in the root isolate.
    pub fn current() -> Isolate {
        CURRENT
            .with(|current| current.borrow().clone())
            .unwrap_or_else(Isolate::root)
    }

    /// Returns the isolate's unique id
    pub fn id(&self) -> IsolateId {
        self.inner.id
    }

    /// Returns the human-readable name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the current lifecycle state
    pub fn state(&self) -> IsolateState {
        *self.lock_state()
    }

    /// Returns true if the isolate is started and not terminated
    pub fn is_running(&self) -> bool {
        self.state() == IsolateState::Started
    }

    /// Moves the isolate from `New` to `Started`
    pub fn start(&self) -> Result<(), IsolateError> {
        let mut state = self.lock_state();
        if *state != IsolateState::New {
            return Err(IsolateError::InvalidTransition {
                id: self.id(),
                from: *state,
                to: IsolateState::Started,
            });
        }
        *state = IsolateState::Started;
        debug!(isolate = %self.id(), name = %self.name(), "isolate started");
        Ok(())
    }

    /// Terminates the isolate. Terminating twice is a no-op.
    pub fn terminate(&self) {
        let mut state = self.lock_state();
        if *state != IsolateState::Terminated {
            *state = IsolateState::Terminated;
            debug!(isolate = %self.id(), name = %self.name(), "isolate terminated");
        }
    }

    /// Binds the calling thread to this isolate until the guard is dropped
    ///
    /// Guards nest: dropping one restores whatever binding was active before it.
    pub fn enter(&self) -> IsolateGuard {
        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        IsolateGuard { previous }
    }

    /// Spawns a thread that runs inside this isolate
    pub fn spawn<F, T>(&self, name: impl Into<String>, f: F) -> Result<JoinHandle<T>, IsolateError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let state = self.state();
        if state != IsolateState::Started {
            return Err(IsolateError::NotRunning {
                id: self.id(),
                state,
            });
        }

        let isolate = self.clone();
        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _guard = isolate.enter();
                f()
            })
            .map_err(|e| IsolateError::SpawnFailed {
                id: self.id(),
                reason: e.to_string(),
            })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, IsolateState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PartialEq for Isolate {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Isolate {}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Scoped thread binding returned by [`Isolate::enter`]
#[must_use = "the binding ends when the guard is dropped"]
pub struct IsolateGuard {
    previous: Option<Isolate>,
}

impl Drop for IsolateGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_isolate_lifecycle() {
        let isolate = Isolate::new("worker");
        assert_eq!(isolate.state(), IsolateState::New);
        assert!(!isolate.is_running());

        isolate.start().unwrap();
        assert_eq!(isolate.state(), IsolateState::Started);
        assert!(isolate.is_running());

        isolate.terminate();
        assert_eq!(isolate.state(), IsolateState::Terminated);
        isolate.terminate();
        assert_eq!(isolate.state(), IsolateState::Terminated);
    }

    #[test]
    fn test_start_twice_fails() {
        let isolate = Isolate::started("svc");
        let err = isolate.start().unwrap_err();
        assert_eq!(
            err,
            IsolateError::InvalidTransition {
                id: isolate.id(),
                from: IsolateState::Started,
                to: IsolateState::Started,
            }
        );
    }

    #[test]
    fn test_terminated_cannot_restart() {
        let isolate = Isolate::new("gone");
        isolate.terminate();
        assert!(matches!(
            isolate.start(),
            Err(IsolateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_root_is_started_and_stable() {
        let root = Isolate::root();
        assert!(root.is_running());
        assert_eq!(root, Isolate::root());
    }

    #[test]
    fn test_unbound_thread_runs_in_root() {
        let id = thread::spawn(|| Isolate::current().id()).join().unwrap();
        assert_eq!(id, Isolate::root().id());
    }

    #[test]
    fn test_enter_binds_and_restores() {
        let outer = Isolate::started("outer");
        let inner = Isolate::started("inner");

        let before = Isolate::current();
        {
            let _g1 = outer.enter();
            assert_eq!(Isolate::current(), outer);
            {
                let _g2 = inner.enter();
                assert_eq!(Isolate::current(), inner);
            }
            assert_eq!(Isolate::current(), outer);
        }
        assert_eq!(Isolate::current(), before);
    }

    #[test]
    fn test_spawn_runs_inside_isolate() {
        let isolate = Isolate::started("spawner");
        let expected = isolate.id();
        let handle = isolate
            .spawn("probe", || Isolate::current().id())
            .unwrap();
        assert_eq!(handle.join().unwrap(), expected);
    }

    #[test]
    fn test_spawn_requires_running_isolate() {
        let isolate = Isolate::new("idle");
        let err = isolate.spawn("probe", || ()).unwrap_err();
        assert_eq!(
            err,
            IsolateError::NotRunning {
                id: isolate.id(),
                state: IsolateState::New,
            }
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", IsolateState::New), "new");
        assert_eq!(format!("{}", IsolateState::Started), "started");
        assert_eq!(format!("{}", IsolateState::Terminated), "terminated");
    }
}
