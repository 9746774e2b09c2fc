//! Bidirectional message channel between a client isolate and a service.

use crate::ConnectionError;
use isolate::Isolate;
use links::{Link, LinkMessage};
use std::fmt;
use std::time::Duration;

/// One end of a service connection
///
/// A connection is two directional links between the same pair of
/// isolates: `outbound` carries messages from this end, `inbound` carries
/// messages to it. Each end is used from threads of its own isolate.
pub struct SystemServiceConnection {
    local: Isolate,
    peer: Isolate,
    outbound: Link,
    inbound: Link,
}

impl SystemServiceConnection {
    /// Creates both ends of a connection between `local` and `remote`
    ///
    /// Returns `(local_end, remote_end)`.
    pub fn pair(local: &Isolate, remote: &Isolate) -> Result<(Self, Self), ConnectionError> {
        let to_remote = Link::between(local, remote)?;
        let to_local = Link::between(remote, local)?;

        let local_end = Self {
            local: local.clone(),
            peer: remote.clone(),
            outbound: to_remote.clone(),
            inbound: to_local.clone(),
        };
        let remote_end = Self {
            local: remote.clone(),
            peer: local.clone(),
            outbound: to_local,
            inbound: to_remote,
        };
        Ok((local_end, remote_end))
    }

    /// Isolate this end belongs to
    pub fn local(&self) -> &Isolate {
        &self.local
    }

    /// Isolate on the other end
    pub fn peer(&self) -> &Isolate {
        &self.peer
    }

    pub fn send(&self, message: &LinkMessage) -> Result<(), ConnectionError> {
        Ok(self.outbound.send(message)?)
    }

    pub fn receive(&self) -> Result<LinkMessage, ConnectionError> {
        Ok(self.inbound.receive()?)
    }

    /// Receives with a bound; `None` or zero waits indefinitely
    pub fn receive_timeout(&self, timeout: Option<Duration>) -> Result<LinkMessage, ConnectionError> {
        Ok(self.inbound.receive_timeout(timeout)?)
    }

    /// Closes both directions, waking blocked operations on either end
    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    pub fn is_open(&self) -> bool {
        self.outbound.is_open() && self.inbound.is_open()
    }
}

impl fmt::Debug for SystemServiceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemServiceConnection")
            .field("local", &self.local.id())
            .field("peer", &self.peer.id())
            .field("open", &self.is_open())
            .finish()
    }
}
