//! Unique identifiers for system entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for an isolation context
///
/// Isolates are independently scheduled execution units. Links are always
/// bound to exactly two of them, so the identifier travels inside every
/// handshake frame that needs to name its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsolateId(Uuid);

impl IsolateId {
    /// Creates a new random isolate ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an isolate ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for IsolateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IsolateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Isolate({})", self.0)
    }
}

/// Unique identifier for a dispatched message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({})", self.0)
    }
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(0);

/// Identifier of one side of a negotiated pipe
///
/// Endpoint ids are issued from a process-wide monotonic counter and are
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(u64);

impl EndpointId {
    /// Issues the next endpoint ID
    pub fn next() -> Self {
        Self(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.0)
    }
}

/// Identifier the pipe service hands out to a registered server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerInstanceId(u64);

impl ServerInstanceId {
    /// Wraps a raw instance id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_id_creation() {
        let id1 = IsolateId::new();
        let id2 = IsolateId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_isolate_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let id = IsolateId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn test_isolate_id_display() {
        let id = IsolateId::new();
        assert!(format!("{}", id).starts_with("Isolate("));
    }

    #[test]
    fn test_isolate_id_serializes_as_uuid() {
        let id = IsolateId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: IsolateId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(json.contains(&id.as_uuid().to_string()));
    }

    #[test]
    fn test_endpoint_ids_are_monotonic() {
        let a = EndpointId::next();
        let b = EndpointId::next();
        assert!(b > a);
    }

    #[test]
    fn test_server_instance_id_roundtrip() {
        let id = ServerInstanceId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(format!("{}", id), "Server(42)");
    }
}
