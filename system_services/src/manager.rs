//! Service table and requestor.

use crate::{ConnectionError, SystemService, SystemServiceConnection};
use isolate::Isolate;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Owns the service-host isolate and the table of registered services
///
/// Clients call [`request_service`](Self::request_service) from their own
/// isolate; the manager builds a connection between that isolate and the
/// host and hands the service its end.
pub struct SystemServiceManager {
    host: Isolate,
    services: Mutex<BTreeMap<String, Arc<dyn SystemService>>>,
}

impl SystemServiceManager {
    /// Creates a manager with a freshly started host isolate
    pub fn new() -> Self {
        Self::with_host(Isolate::started("system-services"))
    }

    /// Creates a manager whose services run in `host`
    pub fn with_host(host: Isolate) -> Self {
        Self {
            host,
            services: Mutex::new(BTreeMap::new()),
        }
    }

    /// The isolate services run in
    pub fn host(&self) -> &Isolate {
        &self.host
    }

    /// Registers and starts a service
    pub fn register_service(&self, service: Arc<dyn SystemService>) -> Result<(), ConnectionError> {
        let id = service.service_id().to_string();
        {
            let mut services = self.lock();
            if services.contains_key(&id) {
                return Err(ConnectionError::AlreadyRegistered(id));
            }
            services.insert(id.clone(), Arc::clone(&service));
        }

        let _guard = self.host.enter();
        service.start();
        info!(service = %id, "system service registered");
        Ok(())
    }

    /// Stops and removes a service
    pub fn unregister_service(&self, service_id: &str) -> Result<Arc<dyn SystemService>, ConnectionError> {
        let service = self
            .lock()
            .remove(service_id)
            .ok_or_else(|| ConnectionError::ServiceNotFound(service_id.to_string()))?;

        let _guard = self.host.enter();
        service.stop();
        info!(service = %service_id, "system service unregistered");
        Ok(service)
    }

    /// Opens a connection from the calling isolate to `service_id`
    pub fn request_service(&self, service_id: &str) -> Result<SystemServiceConnection, ConnectionError> {
        let service = self
            .lock()
            .get(service_id)
            .cloned()
            .ok_or_else(|| ConnectionError::ServiceNotFound(service_id.to_string()))?;

        let caller = Isolate::current();
        let (client_end, service_end) = SystemServiceConnection::pair(&caller, &self.host)?;
        debug!(service = %service_id, caller = %caller.id(), "service connection opened");

        let _guard = self.host.enter();
        service.accept_connection(service_end);
        Ok(client_end)
    }

    /// Ids of all registered services, sorted
    pub fn service_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Stops every registered service
    pub fn shutdown(&self) {
        let services = std::mem::take(&mut *self.lock());
        let _guard = self.host.enter();
        for (id, service) in services {
            service.stop();
            debug!(service = %id, "system service stopped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn SystemService>>> {
        self.services.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for SystemServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
