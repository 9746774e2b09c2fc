//! # Pipe Service
//!
//! Named, versioned pipes between isolates.
//!
//! A server registers a name and version with the pipe service and then
//! accepts clients one at a time. A client asks for a name and the version
//! it needs; the service pairs it with a compatible server and hands both
//! sides a pair of links: what one side sends on its outbound link, the
//! other receives on its inbound link.
//!
//! ## Wire protocol
//!
//! Requests and replies travel on a control connection to the service as
//! JSON [`Frame`]s tagged with a magic number. Links follow frames as
//! separate link messages:
//!
//! - `REGISTER_PIPE_SERVER` -> `OK(server instance)` | `FAIL`
//! - `ACCEPT_PIPE_SERVER` -> accept link | `FAIL`; the accept link later
//!   carries `REGISTER_PIPE_CLIENT`, the server's inbound link and its
//!   outbound link
//! - `REGISTER_PIPE_CLIENT` -> `OK(negotiated version)`, inbound link,
//!   outbound link | `FAIL`
//! - `CLOSE_PIPE_SERVER` -> `OK` | `FAIL`

pub mod config;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod service;
pub mod version;

pub use config::{PipeServiceConfig, PIPE_SERVICE_ID};
pub use error::PipeError;
pub use frame::{Frame, OkPayload};
pub use protocol::{PipeServiceProtocol, ProtocolState, Role};
pub use service::PipeService;
pub use version::{parse_version, ExactVersion, SameMajorAtLeast, VersionPolicy};
