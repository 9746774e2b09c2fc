//! # Core Types
//!
//! This crate defines the identifiers shared by every layer of the link stack.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: Isolates, messages and endpoints each get their own type.
//! - **Type safety first**: An endpoint id can never be passed where an isolate id is expected.
//!
//! ## Key Types
//!
//! - [`IsolateId`]: Identity of an isolation context
//! - [`MessageId`]: Identity of a dispatched message
//! - [`EndpointId`]: Identity of one side of a negotiated pipe
//! - [`ServerInstanceId`]: Identity the pipe service assigns to a registered server

pub mod ids;

pub use ids::{EndpointId, IsolateId, MessageId, ServerInstanceId};
