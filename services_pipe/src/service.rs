//! The pipe service: server registry and handshake broker.
//!
//! Each control connection is served by its own thread in the service host
//! isolate. Servers register under a name and version; every
//! `accept_by_server` parks an accept link in the server's entry. A client
//! registration picks the highest compatible server with a parked accept,
//! creates the two pipe links and delivers one end over the accept link and
//! the other over the client's control connection.

use crate::frame::{Frame, OkPayload};
use crate::version::{parse_version, SameMajorAtLeast, VersionPolicy};
use crate::{PipeError, PipeServiceConfig};
use core_types::{IsolateId, ServerInstanceId};
use isolate::Isolate;
use links::{Link, LinkError, LinkMessage};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;
use system_services::{SystemService, SystemServiceConnection, SystemServiceManager};
use tracing::{debug, info, warn};

struct ServerEntry {
    name: String,
    version: String,
    version_number: u32,
    owner: Isolate,
    connection: u64,
    pending_accepts: VecDeque<Link>,
}

impl ServerEntry {
    fn abort_accepts(&mut self) {
        for link in self.pending_accepts.drain(..) {
            link.close();
        }
    }
}

/// An accept taken for one client registration
struct Claim {
    server: ServerInstanceId,
    version: String,
    owner: Isolate,
    accept: Link,
}

struct RegistryState {
    running: bool,
    next_server: u64,
    next_connection: u64,
    servers: BTreeMap<ServerInstanceId, ServerEntry>,
    connections: HashMap<u64, Arc<SystemServiceConnection>>,
}

struct Registry {
    state: Mutex<RegistryState>,
    changed: Condvar,
}

impl Registry {
    fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                running: false,
                next_server: 1,
                next_connection: 1,
                servers: BTreeMap::new(),
                connections: HashMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn add_connection(&self, connection: Arc<SystemServiceConnection>) -> Option<u64> {
        let mut state = self.lock();
        if !state.running {
            return None;
        }
        let id = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(id, connection);
        Some(id)
    }

    /// Drops a connection and every server registered through it
    fn remove_connection(&self, connection: u64) {
        let mut state = self.lock();
        state.connections.remove(&connection);
        state.servers.retain(|id, entry| {
            if entry.connection != connection {
                return true;
            }
            entry.abort_accepts();
            debug!(server = %id, "server dropped with its connection");
            false
        });
        self.changed.notify_all();
    }

    fn add_server(
        &self,
        name: String,
        version: String,
        version_number: u32,
        owner: Isolate,
        connection: u64,
        max_servers: usize,
    ) -> Result<ServerInstanceId, String> {
        let mut state = self.lock();
        if !state.running {
            return Err("pipe service stopped".into());
        }
        if state.servers.len() >= max_servers {
            return Err(format!("server limit of {} reached", max_servers));
        }
        if state
            .servers
            .values()
            .any(|s| s.name == name && s.version_number == version_number)
        {
            return Err(format!("server {} {} already registered", name, version));
        }

        let id = ServerInstanceId::new(state.next_server);
        state.next_server += 1;
        state.servers.insert(
            id,
            ServerEntry {
                name,
                version,
                version_number,
                owner,
                connection,
                pending_accepts: VecDeque::new(),
            },
        );
        Ok(id)
    }

    /// Parks a new accept link for `server`, which must belong to `connection`
    fn open_accept(
        &self,
        server: ServerInstanceId,
        connection: u64,
        host: &Isolate,
    ) -> Result<Link, String> {
        let mut state = self.lock();
        let entry = state
            .servers
            .get_mut(&server)
            .filter(|entry| entry.connection == connection)
            .ok_or_else(|| format!("unknown server {}", server))?;

        let link = Link::between(host, &entry.owner).map_err(|e| e.to_string())?;
        entry.pending_accepts.push_back(link.clone());
        self.changed.notify_all();
        Ok(link)
    }

    fn remove_server(&self, server: ServerInstanceId, connection: u64) -> Result<(), String> {
        let mut state = self.lock();
        match state.servers.get(&server) {
            Some(entry) if entry.connection == connection => {}
            _ => return Err(format!("unknown server {}", server)),
        }
        if let Some(mut entry) = state.servers.remove(&server) {
            entry.abort_accepts();
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Takes a parked accept from the best compatible server
    ///
    /// Fails at once if no compatible server is registered. Otherwise waits
    /// until `deadline` (forever if `None`) for one of them to accept.
    fn claim_accept(
        &self,
        name: &str,
        requested: u32,
        policy: &dyn VersionPolicy,
        deadline: Option<Instant>,
    ) -> Result<Claim, String> {
        let mut state = self.lock();
        loop {
            if !state.running {
                return Err("pipe service stopped".into());
            }

            let mut candidates: Vec<(&ServerInstanceId, &mut ServerEntry)> = state
                .servers
                .iter_mut()
                .filter(|(_, s)| s.name == name && policy.is_compatible(s.version_number, requested))
                .collect();
            if candidates.is_empty() {
                return Err(format!("no server {} compatible with version {}", name, requested));
            }

            for (_, entry) in candidates.iter_mut() {
                entry.pending_accepts.retain(Link::is_open);
            }
            let best = candidates
                .into_iter()
                .filter(|(_, s)| !s.pending_accepts.is_empty())
                .max_by_key(|(_, s)| s.version_number);
            if let Some((id, entry)) = best {
                if let Some(accept) = entry.pending_accepts.pop_front() {
                    return Ok(Claim {
                        server: *id,
                        version: entry.version.clone(),
                        owner: entry.owner.clone(),
                        accept,
                    });
                }
            }

            state = match deadline {
                None => self.changed.wait(state).unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(format!("no server {} is accepting connections", name));
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|p| p.into_inner().0)
                }
            };
        }
    }

    fn set_running(&self, running: bool) -> Vec<Arc<SystemServiceConnection>> {
        let mut state = self.lock();
        state.running = running;
        let mut dropped = Vec::new();
        if !running {
            for entry in state.servers.values_mut() {
                entry.abort_accepts();
            }
            state.servers.clear();
            dropped = state.connections.drain().map(|(_, c)| c).collect();
        }
        self.changed.notify_all();
        dropped
    }
}

/// Serves one control connection
struct ConnectionHandler {
    id: u64,
    connection: Arc<SystemServiceConnection>,
    registry: Arc<Registry>,
    policy: Arc<dyn VersionPolicy>,
    config: PipeServiceConfig,
}

impl ConnectionHandler {
    fn run(self) {
        debug!(connection = self.id, peer = %self.connection.peer().id(), "pipe connection opened");
        loop {
            let message = match self.connection.receive() {
                Ok(message) => message,
                Err(_) => break,
            };
            let result = match Frame::from_message(&message) {
                Ok(frame) => self.handle(frame),
                Err(e) => self.reply(Frame::fail(e.to_string())),
            };
            if let Err(e) = result {
                if !self.connection.is_open() {
                    break;
                }
                warn!(connection = self.id, error = %e, "pipe request failed");
            }
        }
        self.registry.remove_connection(self.id);
        debug!(connection = self.id, "pipe connection closed");
    }

    fn handle(&self, frame: Frame) -> Result<(), PipeError> {
        match frame {
            Frame::RegisterServer {
                server_name,
                server_version,
                caller,
            } => self.register_server(server_name, server_version, caller),
            Frame::RegisterClient {
                server_name,
                requested_version,
                caller,
            } => self.register_client(server_name, requested_version, caller),
            Frame::AcceptServer { server } => self.accept(server),
            Frame::CloseServer { server } => self.close_server(server),
            other => self.reply(Frame::fail(format!("unexpected request {:#x}", other.magic()))),
        }
    }

    fn register_server(
        &self,
        name: String,
        version: String,
        caller: IsolateId,
    ) -> Result<(), PipeError> {
        if let Err(reason) = self.check_caller(caller) {
            return self.reply(Frame::fail(reason));
        }
        let version_number = match parse_version(&version) {
            Ok(number) => number,
            Err(e) => return self.reply(Frame::fail(e.to_string())),
        };

        let owner = self.connection.peer().clone();
        match self.registry.add_server(
            name.clone(),
            version.clone(),
            version_number,
            owner,
            self.id,
            self.config.max_servers,
        ) {
            Ok(server) => {
                info!(server = %server, name = %name, version = %version, "pipe server registered");
                self.reply(Frame::ok(OkPayload::ServerInstance(server)))
            }
            Err(reason) => {
                warn!(name = %name, version = %version, reason = %reason, "pipe server rejected");
                self.reply(Frame::fail(reason))
            }
        }
    }

    fn register_client(
        &self,
        name: String,
        requested: String,
        caller: IsolateId,
    ) -> Result<(), PipeError> {
        if let Err(reason) = self.check_caller(caller) {
            return self.reply(Frame::fail(reason));
        }
        let requested_number = match parse_version(&requested) {
            Ok(number) => number,
            Err(e) => return self.reply(Frame::fail(e.to_string())),
        };
        let client = self.connection.peer().clone();
        // One deadline covers every retry.
        let deadline = self.config.accept_wait().map(|wait| Instant::now() + wait);

        loop {
            let claim = match self.registry.claim_accept(
                &name,
                requested_number,
                self.policy.as_ref(),
                deadline,
            ) {
                Ok(claim) => claim,
                Err(reason) => {
                    debug!(name = %name, requested = %requested, reason = %reason, "client registration failed");
                    return self.reply(Frame::fail(reason));
                }
            };

            let (to_server, to_client) = match link_pair(&client, &claim.owner) {
                Ok(pair) => pair,
                Err(e) => {
                    claim.accept.close();
                    return self.reply(Frame::fail(e.to_string()));
                }
            };

            let registration = Frame::RegisterClient {
                server_name: name.clone(),
                requested_version: requested.clone(),
                caller,
            };
            match deliver(&claim.accept, &registration, &to_server, &to_client) {
                Ok(()) => {}
                Err(PipeError::Cancelled) => {
                    debug!(server = %claim.server, "accept aborted during delivery, retrying");
                    to_server.close();
                    to_client.close();
                    continue;
                }
                Err(e) => {
                    to_server.close();
                    to_client.close();
                    claim.accept.close();
                    return self.reply(Frame::fail(e.to_string()));
                }
            }

            self.reply(Frame::ok(OkPayload::Version(claim.version.clone())))?;
            self.connection
                .send(&LinkMessage::new_link_message(&to_client))?;
            self.connection
                .send(&LinkMessage::new_link_message(&to_server))?;
            info!(server = %claim.server, name = %name, version = %claim.version, "pipe connected");
            return Ok(());
        }
    }

    fn accept(&self, server: ServerInstanceId) -> Result<(), PipeError> {
        match self
            .registry
            .open_accept(server, self.id, self.connection.local())
        {
            Ok(link) => {
                debug!(server = %server, "accept pending");
                Ok(self
                    .connection
                    .send(&LinkMessage::new_link_message(&link))?)
            }
            Err(reason) => self.reply(Frame::fail(reason)),
        }
    }

    fn close_server(&self, server: ServerInstanceId) -> Result<(), PipeError> {
        match self.registry.remove_server(server, self.id) {
            Ok(()) => {
                info!(server = %server, "pipe server closed");
                self.reply(Frame::ok(OkPayload::Empty))
            }
            Err(reason) => self.reply(Frame::fail(reason)),
        }
    }

    fn check_caller(&self, caller: IsolateId) -> Result<(), String> {
        let peer = self.connection.peer().id();
        if caller != peer {
            warn!(connection = self.id, claimed = %caller, actual = %peer, "caller id mismatch");
            return Err(format!("caller {} does not own this connection", caller));
        }
        Ok(())
    }

    fn reply(&self, frame: Frame) -> Result<(), PipeError> {
        Ok(self.connection.send(&frame.to_message()?)?)
    }
}

/// Creates `(client -> server, server -> client)`
fn link_pair(client: &Isolate, server: &Isolate) -> Result<(Link, Link), LinkError> {
    Ok((Link::between(client, server)?, Link::between(server, client)?))
}

/// Sends a client registration and the server's inbound and outbound links
fn deliver(
    accept: &Link,
    registration: &Frame,
    to_server: &Link,
    to_client: &Link,
) -> Result<(), PipeError> {
    accept.send(&registration.to_message()?)?;
    accept.send(&LinkMessage::new_link_message(to_server))?;
    accept.send(&LinkMessage::new_link_message(to_client))?;
    Ok(())
}

/// The pipe service as hosted by a [`SystemServiceManager`]
pub struct PipeService {
    config: PipeServiceConfig,
    policy: Arc<dyn VersionPolicy>,
    registry: Arc<Registry>,
}

impl PipeService {
    pub fn new(config: PipeServiceConfig) -> Self {
        Self {
            config,
            policy: Arc::new(SameMajorAtLeast),
            registry: Arc::new(Registry::new()),
        }
    }

    /// Replaces the version compatibility check
    pub fn with_policy(mut self, policy: impl VersionPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Registers a default-configured pipe service with `manager`
    pub fn register(manager: &SystemServiceManager) -> Result<Arc<Self>, PipeError> {
        Self::new(PipeServiceConfig::default()).install(manager)
    }

    /// Registers this service with `manager`
    pub fn install(self, manager: &SystemServiceManager) -> Result<Arc<Self>, PipeError> {
        let service = Arc::new(self);
        manager.register_service(service.clone())?;
        Ok(service)
    }

    pub fn config(&self) -> &PipeServiceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.registry.lock().running
    }

    pub fn server_count(&self) -> usize {
        self.registry.lock().servers.len()
    }

    /// Accepts parked across all servers and not yet claimed by a client
    pub fn pending_accept_count(&self) -> usize {
        self.registry
            .lock()
            .servers
            .values()
            .map(|s| s.pending_accepts.iter().filter(|l| l.is_open()).count())
            .sum()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }
}

impl SystemService for PipeService {
    fn service_id(&self) -> &str {
        &self.config.service_id
    }

    fn start(&self) {
        self.registry.set_running(true);
        info!(service = %self.config.service_id, "pipe service started");
    }

    fn stop(&self) {
        for connection in self.registry.set_running(false) {
            connection.close();
        }
        info!(service = %self.config.service_id, "pipe service stopped");
    }

    fn accept_connection(&self, connection: SystemServiceConnection) {
        let connection = Arc::new(connection);
        let id = match self.registry.add_connection(Arc::clone(&connection)) {
            Some(id) => id,
            None => {
                warn!("pipe service not running, refusing connection");
                connection.close();
                return;
            }
        };

        let handler = ConnectionHandler {
            id,
            connection: Arc::clone(&connection),
            registry: Arc::clone(&self.registry),
            policy: Arc::clone(&self.policy),
            config: self.config.clone(),
        };
        let host = connection.local().clone();
        if let Err(e) = host.spawn(format!("pipe-connection-{}", id), move || handler.run()) {
            warn!(connection = id, error = %e, "failed to start pipe connection handler");
            connection.close();
            self.registry.remove_connection(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipeServiceProtocol;
    use std::sync::mpsc;
    use std::time::Duration;

    const BOUND: Duration = Duration::from_secs(5);

    fn setup(config: PipeServiceConfig) -> (Arc<SystemServiceManager>, Arc<PipeService>) {
        let manager = Arc::new(SystemServiceManager::new());
        let service = PipeService::new(config).install(&manager).unwrap();
        (manager, service)
    }

    /// Registers a server in its own isolate and accepts one connection,
    /// echoing one message back
    fn spawn_echo_server(
        manager: &Arc<SystemServiceManager>,
        name: &'static str,
        version: &'static str,
    ) -> (mpsc::Receiver<()>, std::thread::JoinHandle<Result<(), PipeError>>) {
        let manager = Arc::clone(manager);
        let (ready_tx, ready_rx) = mpsc::channel();
        let isolate = Isolate::started(format!("server-{}", version));
        let handle = isolate
            .spawn("echo-server", move || {
                let server = PipeServiceProtocol::get_service(&manager)?;
                server.connect_server(name, version)?;
                let _ = ready_tx.send(());
                let endpoint = server.accept_by_server()?;
                let inbound = endpoint.inbound_link().unwrap();
                let outbound = endpoint.outbound_link().unwrap();
                let message = inbound.receive()?;
                outbound.send(&message)?;
                server.close_server()
            })
            .unwrap();
        (ready_rx, handle)
    }

    #[test]
    fn test_client_server_handshake() {
        let (manager, service) = setup(PipeServiceConfig::default());
        let (ready, server) = spawn_echo_server(&manager, "echo", "1.0.0");
        ready.recv_timeout(BOUND).unwrap();
        assert_eq!(service.server_count(), 1);

        let client = PipeServiceProtocol::get_service(&manager).unwrap();
        client.connect_client("echo", "1.0.0").unwrap();
        assert_eq!(
            client.state(),
            crate::ProtocolState::Connected(crate::Role::Client)
        );
        assert_eq!(client.negotiated_version().as_deref(), Some("1.0.0"));

        client
            .outbound_link()
            .unwrap()
            .send(&LinkMessage::new_string_message("hello"))
            .unwrap();
        let reply = client.inbound_link().unwrap().receive().unwrap();
        assert_eq!(reply.extract_string().unwrap(), "hello");

        server.join().unwrap().unwrap();
        assert_eq!(service.server_count(), 0);
        client.close_client();
    }

    #[test]
    fn test_client_without_server_fails() {
        let (manager, _service) = setup(PipeServiceConfig::default());
        let client = PipeServiceProtocol::get_service(&manager).unwrap();
        assert!(matches!(
            client.connect_client("nobody", "1.0"),
            Err(PipeError::ServiceNotFound(_))
        ));
        assert_eq!(client.state(), crate::ProtocolState::Idle);
    }

    #[test]
    fn test_incompatible_version_fails() {
        let (manager, _service) = setup(PipeServiceConfig::default());
        let server = PipeServiceProtocol::get_service(&manager).unwrap();
        server.connect_server("svc", "1.0").unwrap();

        let client = PipeServiceProtocol::get_service(&manager).unwrap();
        assert!(matches!(
            client.connect_client("svc", "2.0"),
            Err(PipeError::ServiceNotFound(_))
        ));
        assert!(matches!(
            client.connect_client("svc", "1.1"),
            Err(PipeError::ServiceNotFound(_))
        ));
        server.close_server().unwrap();
    }

    #[test]
    fn test_client_waits_are_bounded() {
        let (manager, _service) = setup(PipeServiceConfig {
            accept_wait_ms: 50,
            ..PipeServiceConfig::default()
        });
        let server = PipeServiceProtocol::get_service(&manager).unwrap();
        server.connect_server("idle", "1.0").unwrap();

        let client = PipeServiceProtocol::get_service(&manager).unwrap();
        let err = client.connect_client("idle", "1.0").unwrap_err();
        assert!(matches!(err, PipeError::ServiceNotFound(ref reason) if reason.contains("accepting")));
        server.close_server().unwrap();
    }

    #[test]
    fn test_duplicate_server_rejected() {
        let (manager, _service) = setup(PipeServiceConfig::default());
        let first = PipeServiceProtocol::get_service(&manager).unwrap();
        first.connect_server("dup", "1.0").unwrap();

        let second = PipeServiceProtocol::get_service(&manager).unwrap();
        assert!(matches!(
            second.connect_server("dup", "1.0.0"),
            Err(PipeError::ServiceNotFound(_))
        ));
        assert!(second.connect_server("dup", "1.1").is_ok());
    }

    #[test]
    fn test_server_limit() {
        let (manager, _service) = setup(PipeServiceConfig {
            max_servers: 1,
            ..PipeServiceConfig::default()
        });
        let first = PipeServiceProtocol::get_service(&manager).unwrap();
        first.connect_server("a", "1.0").unwrap();
        let second = PipeServiceProtocol::get_service(&manager).unwrap();
        assert!(second.connect_server("b", "1.0").is_err());
    }

    #[test]
    fn test_forged_caller_rejected() {
        let (manager, _service) = setup(PipeServiceConfig::default());
        let connection = manager.request_service(crate::PIPE_SERVICE_ID).unwrap();
        let forged = Frame::RegisterServer {
            server_name: "forged".into(),
            server_version: "1.0".into(),
            caller: IsolateId::new(),
        };
        connection.send(&forged.to_message().unwrap()).unwrap();
        let reply = Frame::from_message(&connection.receive().unwrap()).unwrap();
        assert!(matches!(reply, Frame::Fail { .. }));
    }

    #[test]
    fn test_close_unknown_server_fails() {
        let (manager, _service) = setup(PipeServiceConfig::default());
        let connection = manager.request_service(crate::PIPE_SERVICE_ID).unwrap();
        let request = Frame::CloseServer {
            server: ServerInstanceId::new(9999),
        };
        connection.send(&request.to_message().unwrap()).unwrap();
        let reply = Frame::from_message(&connection.receive().unwrap()).unwrap();
        assert!(matches!(reply, Frame::Fail { .. }));
    }

    #[test]
    fn test_dropping_connection_removes_servers() {
        let (manager, service) = setup(PipeServiceConfig::default());
        let connection = manager.request_service(crate::PIPE_SERVICE_ID).unwrap();
        let request = Frame::RegisterServer {
            server_name: "transient".into(),
            server_version: "1.0".into(),
            caller: Isolate::current().id(),
        };
        connection.send(&request.to_message().unwrap()).unwrap();
        connection.receive().unwrap();
        assert_eq!(service.server_count(), 1);
        assert_eq!(service.connection_count(), 1);

        connection.close();
        let deadline = Instant::now() + BOUND;
        while service.server_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(service.server_count(), 0);
        assert_eq!(service.connection_count(), 0);
    }

    #[test]
    fn test_claim_deadline_is_not_extended_by_retries() {
        let registry = Registry::new();
        registry.set_running(true);
        let host = Isolate::started("registry-host");
        let owner = Isolate::started("registry-owner");
        let server = registry
            .add_server("retry".into(), "1.0".into(), 10000, owner, 1, 8)
            .unwrap();

        // An accept aborted while a client was being delivered to it.
        let aborted = registry.open_accept(server, 1, &host).unwrap();
        aborted.close();

        let deadline = Instant::now() + Duration::from_millis(50);
        let started = Instant::now();
        for _ in 0..5 {
            let claim = registry.claim_accept("retry", 10000, &SameMajorAtLeast, Some(deadline));
            assert!(matches!(claim, Err(ref reason) if reason.contains("accepting")));
        }
        // Five retries share one 50ms budget.
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_stop_refuses_new_connections() {
        let (manager, service) = setup(PipeServiceConfig::default());
        manager.unregister_service(crate::PIPE_SERVICE_ID).unwrap();
        assert!(!service.is_running());
        assert!(matches!(
            PipeServiceProtocol::get_service(&manager),
            Err(PipeError::ServiceNotFound(_))
        ));
    }
}
