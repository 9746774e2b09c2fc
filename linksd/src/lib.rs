//! # Links Host Daemon
//!
//! Host runtime that boots the system services and runs a pipe session
//! between two isolates.
//!
//! ## Responsibilities
//!
//! The host runtime:
//! - Installs logging
//! - Starts the service manager and the pipe service
//! - Runs an echo server in its own isolate
//! - Connects a client, sends the configured messages and collects replies
//!   through a message dispatcher

pub mod logging;
pub mod runtime;

pub use logging::init_tracing;
pub use runtime::{HostConfig, HostRuntime, HostRuntimeError, SessionReport};
