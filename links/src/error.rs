//! Link error types

use crate::message::PayloadKind;
use core_types::IsolateId;
use isolate::IsolateState;
use std::fmt;
use thiserror::Error;

/// Operation attempted on a link, used in access errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOperation {
    Send,
    Receive,
}

impl fmt::Display for LinkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkOperation::Send => write!(f, "send"),
            LinkOperation::Receive => write!(f, "receive"),
        }
    }
}

/// Errors that can occur when creating or using a link
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// An endpoint isolate is not started, or already terminated
    #[error("Isolate {isolate} is {state}; links require started isolates")]
    InvalidState {
        isolate: IsolateId,
        state: IsolateState,
    },

    /// A required argument was absent
    #[error("Missing argument: {0}")]
    NullArgument(&'static str),

    /// The calling isolate is not the right endpoint for the operation
    #[error("Isolate {caller} may not {operation} on this link")]
    AccessDenied {
        caller: IsolateId,
        operation: LinkOperation,
    },

    /// The operation was aborted because the link is (or became) closed
    #[error("Link closed")]
    ClosedChannel,

    /// A bounded receive expired
    #[error("Operation timed out")]
    TimedOut,

    /// The message does not carry the requested payload kind
    #[error("Expected {expected} payload, found {found}")]
    WrongPayload {
        expected: PayloadKind,
        found: PayloadKind,
    },
}

impl LinkError {
    /// Returns true if the operation was cancelled by a close
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LinkError::ClosedChannel)
    }
}
