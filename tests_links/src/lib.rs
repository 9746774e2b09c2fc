//! Links Integration Test Utilities
//!
//! Shared helpers for cross-crate tests of links, the dispatcher and the
//! pipe service.
//!
//! ## Test Philosophy
//!
//! - **Bounded waits**: every blocking step in a test has a deadline, so a
//!   hang shows up as a failure instead of a stuck run
//! - **Real isolates**: servers and clients run in separately started
//!   isolates so link access rules are exercised

use isolate::Isolate;
use services_pipe::{PipeError, PipeService, PipeServiceConfig, PipeServiceProtocol};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use system_services::SystemServiceManager;

/// Upper bound for any single wait in a test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bootstrap helper for tests
///
/// Creates a service manager with a pipe service registered under its
/// default id.
pub fn test_bootstrap() -> (Arc<SystemServiceManager>, Arc<PipeService>) {
    test_bootstrap_with(PipeServiceConfig::default())
}

/// Like [`test_bootstrap`] with a custom pipe service configuration
pub fn test_bootstrap_with(config: PipeServiceConfig) -> (Arc<SystemServiceManager>, Arc<PipeService>) {
    let manager = Arc::new(SystemServiceManager::new());
    let service = match PipeService::new(config).install(&manager) {
        Ok(service) => service,
        Err(e) => panic!("pipe service failed to install: {}", e),
    };
    (manager, service)
}

/// Creates `count` started isolates named `{prefix}-{n}`
pub fn started_isolates(prefix: &str, count: usize) -> Vec<Isolate> {
    (0..count)
        .map(|n| Isolate::started(format!("{}-{}", prefix, n)))
        .collect()
}

/// A pipe server running on its own thread inside its own isolate
pub struct ServerHandle {
    pub isolate: Isolate,
    pub protocol: Arc<PipeServiceProtocol>,
    pub thread: JoinHandle<Result<Vec<PipeServiceProtocol>, PipeError>>,
}

impl ServerHandle {
    /// Closes the server from inside its isolate, aborting pending accepts
    pub fn close(&self) -> Result<(), PipeError> {
        let _guard = self.isolate.enter();
        self.protocol.close_server()
    }

    /// Closes the server and waits for the accept thread
    pub fn shutdown(self) -> Result<Vec<PipeServiceProtocol>, PipeError> {
        self.close()?;
        self.thread
            .join()
            .map_err(|_| PipeError::Io("server thread panicked".into()))?
    }
}

/// Registers a server `name`/`version` in a fresh isolate and accepts
/// `accepts` clients, returning once registration has completed
///
/// The thread yields every accepted endpoint, or the first accept error.
pub fn spawn_server(
    manager: &Arc<SystemServiceManager>,
    name: &str,
    version: &str,
    accepts: usize,
) -> Result<ServerHandle, PipeError> {
    let isolate = Isolate::started(format!("server-{}-{}", name, version));
    let (tx, rx) = mpsc::channel();
    let manager = Arc::clone(manager);
    let (name, version) = (name.to_string(), version.to_string());

    let thread = isolate
        .spawn("pipe-server", move || {
            let protocol = match PipeServiceProtocol::get_service(&manager)
                .and_then(|p| p.connect_server(&name, &version).map(|_| Arc::new(p)))
            {
                Ok(protocol) => protocol,
                Err(e) => {
                    let _ = tx.send(Err(e.clone()));
                    return Err(e);
                }
            };
            let _ = tx.send(Ok(Arc::clone(&protocol)));

            let mut accepted = Vec::with_capacity(accepts);
            for _ in 0..accepts {
                accepted.push(protocol.accept_by_server()?);
            }
            Ok(accepted)
        })
        .map_err(|e| PipeError::Io(e.to_string()))?;

    let protocol = rx
        .recv_timeout(TEST_TIMEOUT)
        .map_err(|_| PipeError::Io("server did not register in time".into()))??;
    Ok(ServerHandle {
        isolate,
        protocol,
        thread,
    })
}

/// Polls `condition` until it holds or [`TEST_TIMEOUT`] passes
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
