//! Service connection errors

use links::LinkError;
use thiserror::Error;

/// Errors that can occur when requesting or talking to a system service
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection was closed by either side
    #[error("Service connection closed")]
    Closed,

    /// The underlying link failed for a reason other than closing
    #[error("Link failure: {0}")]
    Link(LinkError),

    /// No service is registered under the requested id
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// A service with this id is already registered
    #[error("Service already registered: {0}")]
    AlreadyRegistered(String),
}

impl From<LinkError> for ConnectionError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::ClosedChannel => ConnectionError::Closed,
            other => ConnectionError::Link(other),
        }
    }
}
