//! Pipe protocol errors

use links::LinkError;
use system_services::ConnectionError;
use thiserror::Error;

/// Errors surfaced by the pipe service protocol
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipeError {
    /// No compatible server, or the pipe service itself is not registered
    #[error("Pipe server not found: {0}")]
    ServiceNotFound(String),

    /// A version string is not `major.minor[.micro]`
    #[error("Malformed version: {0:?}")]
    MalformedVersion(String),

    /// A pending accept was aborted by closing the server
    #[error("Operation cancelled")]
    Cancelled,

    /// The pipe service rejected a request or could not be reached
    #[error("Pipe I/O error: {0}")]
    Io(String),

    /// A call was made in the wrong protocol state, or a reply was unexpected
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame could not be encoded or decoded
    #[error("Malformed frame: {0}")]
    Frame(String),
}

impl PipeError {
    /// True if the operation was aborted by a close rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipeError::Cancelled)
    }
}

impl From<LinkError> for PipeError {
    fn from(err: LinkError) -> Self {
        if err.is_cancellation() {
            PipeError::Cancelled
        } else {
            PipeError::Io(err.to_string())
        }
    }
}

impl From<ConnectionError> for PipeError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ServiceNotFound(id) => PipeError::ServiceNotFound(id),
            other => PipeError::Io(format!("cannot communicate with pipe service: {}", other)),
        }
    }
}

impl From<serde_json::Error> for PipeError {
    fn from(err: serde_json::Error) -> Self {
        PipeError::Frame(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_link_is_cancellation() {
        assert!(PipeError::from(LinkError::ClosedChannel).is_cancellation());
        assert!(!PipeError::from(LinkError::TimedOut).is_cancellation());
    }

    #[test]
    fn test_closed_connection_is_io() {
        assert!(matches!(
            PipeError::from(ConnectionError::Closed),
            PipeError::Io(_)
        ));
    }
}
