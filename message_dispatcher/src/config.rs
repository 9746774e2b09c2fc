//! Dispatcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for a [`MessageDispatcher`](crate::MessageDispatcher)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum messages buffered per message type
    pub queue_capacity: usize,
    /// How long a dispatch loop waits for a message before re-checking for shutdown
    pub poll_interval_ms: u64,
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            poll_interval_ms: 200,
        }
    }
}
