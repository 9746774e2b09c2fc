//! Client and server side of the pipe handshake.
//!
//! A `PipeServiceProtocol` starts `Idle` and becomes either a client
//! (`connect_client`) or a server (`connect_server`). A connected server
//! produces one `Accepted` endpoint per `accept_by_server` call. Clients and
//! accepted endpoints own an inbound and an outbound link; closing either
//! side closes both links.

use crate::frame::{Frame, OkPayload};
use crate::version::parse_version;
use crate::{PipeError, PIPE_SERVICE_ID};
use core_types::{EndpointId, ServerInstanceId};
use isolate::Isolate;
use links::{Link, LinkMessage};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use system_services::{SystemServiceConnection, SystemServiceManager};
use tracing::debug;

/// Which side of a pipe this protocol instance is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
    /// Server-side endpoint of one accepted client connection
    Accepted,
}

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    AwaitingRegistration(Role),
    Connected(Role),
    Closed,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Idle => write!(f, "idle"),
            ProtocolState::AwaitingRegistration(role) => write!(f, "awaiting {:?} registration", role),
            ProtocolState::Connected(role) => write!(f, "connected as {:?}", role),
            ProtocolState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Default)]
struct Endpoint {
    server_name: Option<String>,
    requested_version: Option<String>,
    negotiated_version: Option<String>,
    inbound: Option<Link>,
    outbound: Option<Link>,
    server_instance: Option<ServerInstanceId>,
    accept_links: Vec<Link>,
}

struct Inner {
    state: ProtocolState,
    endpoint: Endpoint,
}

/// One pipe endpoint plus the control connection used to negotiate it
pub struct PipeServiceProtocol {
    id: EndpointId,
    control: Option<Arc<SystemServiceConnection>>,
    // Serializes request/reply exchanges on the control connection.
    exchange: Mutex<()>,
    inner: Mutex<Inner>,
}

impl PipeServiceProtocol {
    /// Opens a control connection to the pipe service registered with `manager`
    pub fn get_service(manager: &SystemServiceManager) -> Result<Self, PipeError> {
        Self::get_service_with_id(manager, PIPE_SERVICE_ID)
    }

    /// Like [`get_service`](Self::get_service) for a service registered under another id
    pub fn get_service_with_id(
        manager: &SystemServiceManager,
        service_id: &str,
    ) -> Result<Self, PipeError> {
        let control = manager.request_service(service_id)?;
        Ok(Self::with_control(Some(Arc::new(control)), ProtocolState::Idle, Endpoint::default()))
    }

    fn with_control(
        control: Option<Arc<SystemServiceConnection>>,
        state: ProtocolState,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            id: EndpointId::next(),
            control,
            exchange: Mutex::new(()),
            inner: Mutex::new(Inner { state, endpoint }),
        }
    }

    /// Registers as a client of `server_name` and waits for a server to accept
    ///
    /// On success the inbound and outbound links are available. A `Fail`
    /// reply leaves the protocol `Idle` and is reported as `ServiceNotFound`.
    pub fn connect_client(&self, server_name: &str, requested_version: &str) -> Result<(), PipeError> {
        parse_version(requested_version)?;
        self.begin(Role::Client)?;
        debug!(endpoint = %self.id, server_name, requested_version, "connecting client");

        let result = self.client_handshake(server_name, requested_version);
        let mut inner = self.lock();
        match result {
            Ok((negotiated, inbound, outbound)) => {
                inner.state = ProtocolState::Connected(Role::Client);
                inner.endpoint.server_name = Some(server_name.to_string());
                inner.endpoint.requested_version = Some(requested_version.to_string());
                inner.endpoint.negotiated_version = Some(negotiated);
                inner.endpoint.inbound = Some(inbound);
                inner.endpoint.outbound = Some(outbound);
                debug!(endpoint = %self.id, server_name, "client connected");
                Ok(())
            }
            Err(e) => {
                inner.state = ProtocolState::Idle;
                Err(e)
            }
        }
    }

    fn client_handshake(
        &self,
        server_name: &str,
        requested_version: &str,
    ) -> Result<(String, Link, Link), PipeError> {
        let control = self.control()?;
        let _exchange = self.exchange();

        let request = Frame::RegisterClient {
            server_name: server_name.to_string(),
            requested_version: requested_version.to_string(),
            caller: Isolate::current().id(),
        };
        let negotiated = match round_trip(control, &request)? {
            Frame::Ok {
                payload: OkPayload::Version(version),
            } => version,
            Frame::Fail { reason } => return Err(PipeError::ServiceNotFound(reason)),
            other => return Err(unexpected(&other)),
        };

        let inbound = receive_link(control)?;
        let outbound = receive_link(control)?;
        Ok((negotiated, inbound, outbound))
    }

    /// Registers a server under `server_name` and `server_version`
    pub fn connect_server(&self, server_name: &str, server_version: &str) -> Result<(), PipeError> {
        parse_version(server_version)?;
        self.begin(Role::Server)?;
        debug!(endpoint = %self.id, server_name, server_version, "connecting server");

        let result = self.server_handshake(server_name, server_version);
        let mut inner = self.lock();
        match result {
            Ok(instance) => {
                inner.state = ProtocolState::Connected(Role::Server);
                inner.endpoint.server_name = Some(server_name.to_string());
                inner.endpoint.negotiated_version = Some(server_version.to_string());
                inner.endpoint.server_instance = Some(instance);
                debug!(endpoint = %self.id, server = %instance, "server registered");
                Ok(())
            }
            Err(e) => {
                inner.state = ProtocolState::Idle;
                Err(e)
            }
        }
    }

    fn server_handshake(
        &self,
        server_name: &str,
        server_version: &str,
    ) -> Result<ServerInstanceId, PipeError> {
        let control = self.control()?;
        let _exchange = self.exchange();

        let request = Frame::RegisterServer {
            server_name: server_name.to_string(),
            server_version: server_version.to_string(),
            caller: Isolate::current().id(),
        };
        match round_trip(control, &request)? {
            Frame::Ok {
                payload: OkPayload::ServerInstance(instance),
            } => Ok(instance),
            Frame::Fail { reason } => Err(PipeError::ServiceNotFound(reason)),
            other => Err(unexpected(&other)),
        }
    }

    /// Blocks until a client connects, returning the server side of that connection
    ///
    /// Fails with `Cancelled` if [`close_server`](Self::close_server) runs
    /// while waiting.
    pub fn accept_by_server(&self) -> Result<PipeServiceProtocol, PipeError> {
        let (instance, server_name, server_version) = {
            let inner = self.lock();
            match (inner.state, inner.endpoint.server_instance) {
                (ProtocolState::Connected(Role::Server), Some(instance)) => (
                    instance,
                    inner.endpoint.server_name.clone(),
                    inner.endpoint.negotiated_version.clone(),
                ),
                (state, _) => {
                    return Err(PipeError::Protocol(format!("cannot accept while {}", state)))
                }
            }
        };

        let accept_link = {
            let control = self.control()?;
            let _exchange = self.exchange();
            control.send(&Frame::AcceptServer { server: instance }.to_message()?)?;
            let reply = control.receive()?;
            if reply.contains_link() {
                reply.extract_link()?
            } else {
                return Err(match Frame::from_message(&reply)? {
                    Frame::Fail { reason } => PipeError::Io(reason),
                    other => unexpected(&other),
                });
            }
        };
        {
            let mut inner = self.lock();
            if inner.state == ProtocolState::Connected(Role::Server) {
                inner.endpoint.accept_links.push(accept_link.clone());
            } else {
                // close_server ran during the exchange
                accept_link.close();
            }
        }
        debug!(endpoint = %self.id, server = %instance, "waiting for client");

        let result = accept_on(&accept_link);
        accept_link.close();
        self.lock()
            .endpoint
            .accept_links
            .retain(|link| link.point_id() != accept_link.point_id());

        let (requested_version, inbound, outbound) = result?;
        let accepted = Self::with_control(
            None,
            ProtocolState::Connected(Role::Accepted),
            Endpoint {
                server_name,
                requested_version: Some(requested_version),
                negotiated_version: server_version,
                inbound: Some(inbound),
                outbound: Some(outbound),
                server_instance: Some(instance),
                accept_links: Vec::new(),
            },
        );
        debug!(endpoint = %self.id, accepted = %accepted.id, "client accepted");
        Ok(accepted)
    }

    /// Aborts pending accepts and unregisters the server
    ///
    /// A non-OK reply from the pipe service is reported as `Io`.
    pub fn close_server(&self) -> Result<(), PipeError> {
        let (instance, accept_links) = {
            let mut inner = self.lock();
            if inner.state != ProtocolState::Connected(Role::Server) {
                return Err(PipeError::Protocol(format!(
                    "cannot close server while {}",
                    inner.state
                )));
            }
            inner.state = ProtocolState::Closed;
            (
                inner.endpoint.server_instance,
                std::mem::take(&mut inner.endpoint.accept_links),
            )
        };

        for link in &accept_links {
            link.close();
        }

        let instance =
            instance.ok_or_else(|| PipeError::Protocol("server has no instance id".into()))?;
        let control = self.control()?;
        let _exchange = self.exchange();
        match round_trip(control, &Frame::CloseServer { server: instance })? {
            Frame::Ok { .. } => {
                debug!(endpoint = %self.id, server = %instance, "server closed");
                Ok(())
            }
            Frame::Fail { reason } => Err(PipeError::Io(reason)),
            other => Err(unexpected(&other)),
        }
    }

    /// Closes the inbound and outbound links
    pub fn close_client(&self) {
        let mut inner = self.lock();
        if let Some(link) = &inner.endpoint.inbound {
            link.close();
        }
        if let Some(link) = &inner.endpoint.outbound {
            link.close();
        }
        inner.state = ProtocolState::Closed;
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    pub fn state(&self) -> ProtocolState {
        self.lock().state
    }

    pub fn server_name(&self) -> Option<String> {
        self.lock().endpoint.server_name.clone()
    }

    pub fn requested_version(&self) -> Option<String> {
        self.lock().endpoint.requested_version.clone()
    }

    /// Version of the server actually connected to
    pub fn negotiated_version(&self) -> Option<String> {
        self.lock().endpoint.negotiated_version.clone()
    }

    pub fn server_instance_id(&self) -> Option<ServerInstanceId> {
        self.lock().endpoint.server_instance
    }

    pub fn inbound_link(&self) -> Option<Link> {
        self.lock().endpoint.inbound.clone()
    }

    pub fn outbound_link(&self) -> Option<Link> {
        self.lock().endpoint.outbound.clone()
    }

    fn begin(&self, role: Role) -> Result<(), PipeError> {
        let mut inner = self.lock();
        if inner.state != ProtocolState::Idle {
            return Err(PipeError::Protocol(format!(
                "cannot connect as {:?} while {}",
                role, inner.state
            )));
        }
        inner.state = ProtocolState::AwaitingRegistration(role);
        Ok(())
    }

    fn control(&self) -> Result<&SystemServiceConnection, PipeError> {
        self.control
            .as_deref()
            .ok_or_else(|| PipeError::Protocol("accepted endpoints have no control connection".into()))
    }

    fn exchange(&self) -> MutexGuard<'_, ()> {
        self.exchange.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for PipeServiceProtocol {
    fn drop(&mut self) {
        if let Some(control) = &self.control {
            control.close();
        }
    }
}

impl fmt::Debug for PipeServiceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("PipeServiceProtocol")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("server_name", &inner.endpoint.server_name)
            .field("negotiated_version", &inner.endpoint.negotiated_version)
            .finish()
    }
}

fn round_trip(control: &SystemServiceConnection, request: &Frame) -> Result<Frame, PipeError> {
    control.send(&request.to_message()?)?;
    Frame::from_message(&control.receive()?)
}

fn receive_link(control: &SystemServiceConnection) -> Result<Link, PipeError> {
    let message = control.receive()?;
    message
        .extract_link()
        .map_err(|e| PipeError::Protocol(format!("expected a link: {}", e)))
}

/// Waits on an accept link for a client registration and its two links
fn accept_on(accept_link: &Link) -> Result<(String, Link, Link), PipeError> {
    let requested_version = match Frame::from_message(&accept_link.receive()?)? {
        Frame::RegisterClient {
            requested_version, ..
        } => requested_version,
        other => return Err(PipeError::Io(format!("unexpected frame on accept link: {:?}", other))),
    };
    let inbound = extract_accepted_link(accept_link.receive()?)?;
    let outbound = extract_accepted_link(accept_link.receive()?)?;
    Ok((requested_version, inbound, outbound))
}

fn extract_accepted_link(message: LinkMessage) -> Result<Link, PipeError> {
    message
        .extract_link()
        .map_err(|e| PipeError::Io(format!("expected a link on accept link: {}", e)))
}

fn unexpected(frame: &Frame) -> PipeError {
    PipeError::Protocol(format!("unexpected reply: {:?}", frame))
}
