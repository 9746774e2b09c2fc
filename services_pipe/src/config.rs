//! Pipe service configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Well-known id the pipe service registers under
pub const PIPE_SERVICE_ID: &str = "com.sun.midp.io.pipe";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeServiceConfig {
    /// Id registered with the service manager
    pub service_id: String,
    /// How long a client registration waits for a matching server to accept;
    /// 0 waits until the server closes
    pub accept_wait_ms: u64,
    /// Maximum number of concurrently registered servers
    pub max_servers: usize,
}

impl PipeServiceConfig {
    pub fn accept_wait(&self) -> Option<Duration> {
        match self.accept_wait_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for PipeServiceConfig {
    fn default() -> Self {
        Self {
            service_id: PIPE_SERVICE_ID.to_string(),
            accept_wait_ms: 0,
            max_servers: 256,
        }
    }
}
