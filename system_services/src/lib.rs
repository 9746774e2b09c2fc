//! # System Services
//!
//! The boundary through which a host process publishes long-lived services
//! to isolates.
//!
//! ## Philosophy
//!
//! - Services live in a dedicated host isolate
//! - Clients never share state with a service; they talk over a
//!   [`SystemServiceConnection`] built from two links
//! - Discovery is by service id through the [`SystemServiceManager`]

pub mod connection;
pub mod error;
pub mod manager;

pub use connection::SystemServiceConnection;
pub use error::ConnectionError;
pub use manager::SystemServiceManager;

/// A service hosted by the [`SystemServiceManager`]
///
/// `start`, `stop` and `accept_connection` are called from a thread bound
/// to the host isolate.
pub trait SystemService: Send + Sync {
    /// Unique id clients use to request this service
    fn service_id(&self) -> &str;

    fn start(&self);

    fn stop(&self);

    /// Takes ownership of the service end of a new client connection
    ///
    /// Must not block; long-running conversations belong on their own thread.
    fn accept_connection(&self, connection: SystemServiceConnection);
}
