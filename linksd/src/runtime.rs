//! # Host Runtime
//!
//! Boots the services and drives one echo session.

use isolate::{Isolate, IsolateError};
use links::{LinkError, LinkMessage};
use message_dispatcher::{DispatchError, DispatcherConfig, Envelope, Mailbox, MessageDispatcher};
use services_pipe::{PipeError, PipeService, PipeServiceProtocol};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use system_services::SystemServiceManager;
use thiserror::Error;
use tracing::{debug, info, warn};

const REPLY_TYPE: &str = "echo.reply";
const REPLY_WAIT: Duration = Duration::from_secs(5);

/// Host runtime error types
#[derive(Debug, Error)]
pub enum HostRuntimeError {
    #[error("Pipe error: {0}")]
    Pipe(#[from] PipeError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Isolate error: {0}")]
    Isolate(#[from] IsolateError),

    #[error("Echo server failed: {0}")]
    Server(String),
}

/// Host runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Pipe name the echo server registers
    pub server_name: String,
    /// Version the echo server registers and the client requests
    pub server_version: String,
    /// Messages the client sends, in order
    pub messages: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server_name: "echo".to_string(),
            server_version: "1.0.0".to_string(),
            messages: vec!["hello".to_string()],
        }
    }
}

/// Outcome of one echo session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Version the client was connected at
    pub negotiated_version: String,
    /// Replies in the order they arrived
    pub replies: Vec<String>,
}

/// Host runtime
pub struct HostRuntime {
    config: HostConfig,
    manager: Arc<SystemServiceManager>,
}

impl HostRuntime {
    /// Creates the service manager and registers the pipe service
    pub fn new(config: HostConfig) -> Result<Self, HostRuntimeError> {
        let manager = Arc::new(SystemServiceManager::new());
        PipeService::register(&manager)?;
        Ok(Self { config, manager })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Runs the echo session to completion
    pub fn run(&self) -> Result<SessionReport, HostRuntimeError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let server_isolate = Isolate::started("echo-server");
        let server = {
            let manager = Arc::clone(&self.manager);
            let name = self.config.server_name.clone();
            let version = self.config.server_version.clone();
            server_isolate.spawn("echo-server", move || {
                serve_echo(&manager, &name, &version, ready_tx)
            })?
        };
        if ready_rx.recv().is_err() {
            return Err(match server.join() {
                Ok(Err(e)) => e,
                Ok(Ok(())) => HostRuntimeError::Server("server exited before registering".into()),
                Err(_) => HostRuntimeError::Server("server thread panicked".into()),
            });
        }

        let client = PipeServiceProtocol::get_service(&self.manager)?;
        client.connect_client(&self.config.server_name, &self.config.server_version)?;
        let negotiated_version = client.negotiated_version().unwrap_or_default();
        info!(
            server = %self.config.server_name,
            version = %negotiated_version,
            "client connected"
        );

        let replies = self.exchange(&client);
        client.close_client();

        let served = server
            .join()
            .map_err(|_| HostRuntimeError::Server("server thread panicked".into()))?;
        server_isolate.terminate();

        let replies = replies?;
        served?;
        Ok(SessionReport {
            negotiated_version,
            replies,
        })
    }

    /// Sends every configured message and routes the replies through a dispatcher
    fn exchange(&self, client: &PipeServiceProtocol) -> Result<Vec<String>, HostRuntimeError> {
        let (outbound, inbound) = match (client.outbound_link(), client.inbound_link()) {
            (Some(outbound), Some(inbound)) => (outbound, inbound),
            _ => return Err(PipeError::Protocol("client has no pipe links".into()).into()),
        };

        let config = DispatcherConfig::default();
        let mailbox = Mailbox::new(config.queue_capacity);
        let dispatcher = MessageDispatcher::with_mailbox(&mailbox, config);
        dispatcher.register_direct(REPLY_TYPE)?;

        let mut replies = Vec::with_capacity(self.config.messages.len());
        for text in &self.config.messages {
            outbound.send(&LinkMessage::new_string_message(text))?;
            let reply = inbound.receive()?;
            mailbox.post(Envelope::new(REPLY_TYPE, reply).with_source(outbound.receiver()))?;

            let envelope = dispatcher.wait_for_message(REPLY_TYPE, Some(REPLY_WAIT))?;
            let reply = envelope.payload.extract_string()?;
            debug!(sent = %text, received = %reply, "echo round trip");
            replies.push(reply);
        }

        dispatcher.shutdown();
        Ok(replies)
    }

    /// Stops the registered services
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Registers an echo server and echoes on one accepted connection until the client closes
fn serve_echo(
    manager: &SystemServiceManager,
    name: &str,
    version: &str,
    ready: mpsc::Sender<()>,
) -> Result<(), HostRuntimeError> {
    let server = PipeServiceProtocol::get_service(manager)?;
    server.connect_server(name, version)?;
    let _ = ready.send(());

    let endpoint = server.accept_by_server()?;
    let (inbound, outbound) = match (endpoint.inbound_link(), endpoint.outbound_link()) {
        (Some(inbound), Some(outbound)) => (inbound, outbound),
        _ => return Err(PipeError::Protocol("accepted endpoint has no links".into()).into()),
    };

    let mut echoed = 0usize;
    loop {
        match inbound.receive() {
            Ok(message) => {
                outbound.send(&message)?;
                echoed += 1;
            }
            Err(e) if e.is_cancellation() => break,
            Err(e) => {
                warn!(error = %e, "echo server receive failed");
                return Err(e.into());
            }
        }
    }

    endpoint.close_client();
    server.close_server()?;
    info!(echoed, "echo server finished");
    Ok(())
}
