//! Dispatcher error types

use thiserror::Error;

/// Errors that can occur when registering for or waiting on messages
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Direct and handler registration collided on one message type
    #[error("Message type {message_type}: {reason}")]
    TypeConflict {
        message_type: String,
        reason: &'static str,
    },

    /// A bounded wait expired
    #[error("Timed out waiting for a message")]
    TimedOut,

    /// The dispatcher or its queues were shut down
    #[error("Dispatcher closed")]
    Closed,

    /// The queue for a message type is at capacity
    #[error("Receive queue full for message type {0}")]
    QueueFull(String),

    /// A dispatch loop thread could not be started
    #[error("Failed to start dispatch loop: {0}")]
    SpawnFailed(String),

    /// The registration was already cancelled or never issued here
    #[error("Unknown registration for message type {0}")]
    UnknownRegistration(String),
}

/// Error reported by a message handler
///
/// Handler errors are logged by the dispatch loop and never stop delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
