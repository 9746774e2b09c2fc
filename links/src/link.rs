//! Link handles

use crate::point::RendezvousPoint;
use crate::{LinkError, LinkMessage, LinkOperation};
use core_types::IsolateId;
use isolate::{Isolate, IsolateState};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hash code every closed link reports
pub const CLOSED_LINK_HASH: u64 = 0;

/// A directional, closable rendezvous channel between two isolates
///
/// Only threads running in the sending isolate may `send`, and only threads
/// running in the receiving isolate may `receive`. A link from an isolate to
/// itself allows both. Any holder may `close`.
///
/// Cloning a link adds a reference to its rendezvous point; the point is
/// reclaimed when the last handle is dropped. Closing is shared: once any
/// handle closes the link, every handle observes it closed.
///
/// Two links are equal iff both are closed, or both share the same point.
#[derive(Clone)]
pub struct Link {
    sender: IsolateId,
    receiver: IsolateId,
    point: Arc<RendezvousPoint>,
}

impl Link {
    /// Creates a link from `from` (the sender) to `to` (the receiver)
    ///
    /// Both isolates must be started and not terminated.
    pub fn new_link(from: Option<&Isolate>, to: Option<&Isolate>) -> Result<Link, LinkError> {
        let from = from.ok_or(LinkError::NullArgument("from"))?;
        let to = to.ok_or(LinkError::NullArgument("to"))?;

        for isolate in [from, to] {
            let state = isolate.state();
            if state != IsolateState::Started {
                return Err(LinkError::InvalidState {
                    isolate: isolate.id(),
                    state,
                });
            }
        }

        let link = Link {
            sender: from.id(),
            receiver: to.id(),
            point: Arc::new(RendezvousPoint::new()),
        };
        debug!(
            point = link.point.id(),
            sender = %link.sender,
            receiver = %link.receiver,
            "link created"
        );
        Ok(link)
    }

    /// Convenience wrapper around [`Link::new_link`] for present isolates
    pub fn between(from: &Isolate, to: &Isolate) -> Result<Link, LinkError> {
        Self::new_link(Some(from), Some(to))
    }

    /// Returns the sending isolate's id
    pub fn sender(&self) -> IsolateId {
        self.sender
    }

    /// Returns the receiving isolate's id
    pub fn receiver(&self) -> IsolateId {
        self.receiver
    }

    pub fn is_open(&self) -> bool {
        !self.point.is_closed()
    }

    /// Sends a copy of `message`, blocking until a receiver takes it
    ///
    /// Fails with `ClosedChannel` if the link is closed before or while
    /// waiting. A send that has already been handed off is not affected by
    /// a later close.
    pub fn send(&self, message: &LinkMessage) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::ClosedChannel);
        }
        self.check_access(self.sender, LinkOperation::Send)?;
        self.point.send(message.clone())
    }

    /// Receives the next message, blocking until a sender arrives
    pub fn receive(&self) -> Result<LinkMessage, LinkError> {
        self.receive_timeout(None)
    }

    /// Receives the next message, giving up after `timeout`
    ///
    /// A `None` or zero timeout blocks indefinitely.
    pub fn receive_timeout(&self, timeout: Option<Duration>) -> Result<LinkMessage, LinkError> {
        if !self.is_open() {
            return Err(LinkError::ClosedChannel);
        }
        self.check_access(self.receiver, LinkOperation::Receive)?;
        self.point.receive(timeout)
    }

    /// Closes the link, waking every blocked sender and receiver
    ///
    /// Closing an already closed link is a no-op.
    pub fn close(&self) {
        if self.point.close() {
            debug!(point = self.point.id(), "link closed");
        }
    }

    /// Hash code of the link: the point's identity while open, 0 once closed
    pub fn hash_code(&self) -> u64 {
        if self.is_open() {
            self.point.id()
        } else {
            CLOSED_LINK_HASH
        }
    }

    /// Identity of the underlying rendezvous point
    pub fn point_id(&self) -> u64 {
        self.point.id()
    }

    /// Number of link handles sharing this link's rendezvous point
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.point)
    }

    /// Drops this handle and reclaims the point if it was the last reference
    ///
    /// Returns the id of the reclaimed point, or `None` if other handles
    /// still reference it.
    pub fn release(self) -> Option<u64> {
        let id = self.point.id();
        match Arc::try_unwrap(self.point) {
            Ok(point) => {
                drop(point);
                Some(id)
            }
            Err(_) => None,
        }
    }

    fn check_access(&self, allowed: IsolateId, operation: LinkOperation) -> Result<(), LinkError> {
        let caller = Isolate::current().id();
        if caller != allowed {
            return Err(LinkError::AccessDenied { caller, operation });
        }
        Ok(())
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        match (self.is_open(), other.is_open()) {
            (false, false) => true,
            (true, true) => Arc::ptr_eq(&self.point, &other.point),
            _ => false,
        }
    }
}

impl Eq for Link {}

impl Hash for Link {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_code().hash(state);
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("point", &self.point.id())
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim;
    use std::sync::mpsc;
    use std::thread;

    const BLOCKED: Duration = Duration::from_millis(50);
    const BOUND: Duration = Duration::from_secs(5);

    fn self_link() -> Link {
        let here = Isolate::current();
        Link::between(&here, &here).unwrap()
    }

    fn spawn_sender(
        link: &Link,
        message: LinkMessage,
    ) -> mpsc::Receiver<Result<(), LinkError>> {
        let link = link.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(link.send(&message));
        });
        rx
    }

    fn spawn_receiver(link: &Link) -> mpsc::Receiver<Result<LinkMessage, LinkError>> {
        let link = link.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(link.receive());
        });
        rx
    }

    #[test]
    fn test_create_and_close() {
        let link = self_link();
        assert!(link.is_open());

        link.close();
        assert!(!link.is_open());

        link.close();
        assert!(!link.is_open());
    }

    #[test]
    fn test_null_arguments() {
        let here = Isolate::current();
        assert_eq!(
            Link::new_link(None, None),
            Err(LinkError::NullArgument("from"))
        );
        assert_eq!(
            Link::new_link(None, Some(&here)),
            Err(LinkError::NullArgument("from"))
        );
        assert_eq!(
            Link::new_link(Some(&here), None),
            Err(LinkError::NullArgument("to"))
        );
        assert!(Link::new_link(Some(&here), Some(&here)).is_ok());
    }

    #[test]
    fn test_equality_and_hash() {
        let link = self_link();
        let link2 = self_link();

        assert_eq!(link, link);
        assert_eq!(link, link.clone());
        assert_ne!(link, link2);
        assert_ne!(link.hash_code(), CLOSED_LINK_HASH);

        link.close();
        assert_eq!(link.hash_code(), CLOSED_LINK_HASH);
        assert_ne!(link, link2);

        link2.close();
        assert_eq!(link, link2);
    }

    #[test]
    fn test_receive_on_closed_link() {
        let link = self_link();
        link.close();
        assert_eq!(link.receive(), Err(LinkError::ClosedChannel));
    }

    #[test]
    fn test_send_on_closed_link() {
        let link = self_link();
        link.close();
        let err = link
            .send(&LinkMessage::new_string_message("foo"))
            .unwrap_err();
        assert_eq!(err, LinkError::ClosedChannel);
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_receive_then_send() {
        let link = self_link();
        let receiver = spawn_receiver(&link);
        assert!(receiver.recv_timeout(BLOCKED).is_err(), "receiver should block");

        link.send(&LinkMessage::new_string_message("bar")).unwrap();

        let msg = receiver.recv_timeout(BOUND).unwrap().unwrap();
        assert_eq!(msg.extract_string().unwrap(), "bar");
    }

    #[test]
    fn test_send_then_receive() {
        let link = self_link();
        let sender = spawn_sender(&link, LinkMessage::new_string_message("foo"));
        assert!(sender.recv_timeout(BLOCKED).is_err(), "sender should block");

        let msg = link.receive().unwrap();
        assert_eq!(sender.recv_timeout(BOUND).unwrap(), Ok(()));
        assert_eq!(msg.extract_string().unwrap(), "foo");
    }

    #[test]
    fn test_received_data_is_a_copy() {
        let link = self_link();
        let mut buffer = vec![7u8; 4];
        let message = LinkMessage::new_data_message(&buffer);
        let sender = spawn_sender(&link, message.clone());

        let received = link.receive().unwrap();
        sender.recv_timeout(BOUND).unwrap().unwrap();

        buffer[0] = 0;
        let mut data = received.extract_data().unwrap();
        assert_eq!(data, vec![7u8; 4]);
        data[1] = 0;
        assert_eq!(received.extract_data().unwrap(), vec![7u8; 4]);
        assert_eq!(received, message);
    }

    #[test]
    fn test_close_unblocks_receiver() {
        let link = self_link();
        let receiver = spawn_receiver(&link);
        assert!(receiver.recv_timeout(BLOCKED).is_err());

        link.close();
        assert_eq!(
            receiver.recv_timeout(BOUND).unwrap(),
            Err(LinkError::ClosedChannel)
        );
    }

    #[test]
    fn test_close_unblocks_sender() {
        let link = self_link();
        let sender = spawn_sender(&link, LinkMessage::new_string_message("foobar"));
        assert!(sender.recv_timeout(BLOCKED).is_err());

        link.close();
        assert_eq!(
            sender.recv_timeout(BOUND).unwrap(),
            Err(LinkError::ClosedChannel)
        );
    }

    #[test]
    fn test_close_after_handoff_keeps_send_result() {
        let link = self_link();
        let sender = spawn_sender(&link, LinkMessage::new_string_message("foobar"));

        let msg = link.receive().unwrap();
        link.close();
        assert_eq!(sender.recv_timeout(BOUND).unwrap(), Ok(()));
        assert_eq!(msg.extract_string().unwrap(), "foobar");
    }

    #[test]
    fn test_close_after_receive_keeps_received_message() {
        let link = self_link();
        let receiver = spawn_receiver(&link);
        thread::sleep(BLOCKED);

        link.send(&LinkMessage::new_string_message("done")).unwrap();
        link.close();

        let msg = receiver.recv_timeout(BOUND).unwrap().unwrap();
        assert_eq!(msg.extract_string().unwrap(), "done");
    }

    #[test]
    fn test_receive_timeout() {
        let link = self_link();
        assert_eq!(
            link.receive_timeout(Some(Duration::from_millis(20))),
            Err(LinkError::TimedOut)
        );
        assert!(link.is_open());
    }

    #[test]
    fn test_multiple_senders() {
        let link = self_link();
        let shared = LinkMessage::new_string_message("1");
        let private = LinkMessage::new_string_message("2");

        let senders = [
            spawn_sender(&link, shared.clone()),
            spawn_sender(&link, private.clone()),
            spawn_sender(&link, shared.clone()),
        ];

        let mut received: Vec<String> = (0..3)
            .map(|_| link.receive().unwrap().extract_string().unwrap())
            .collect();
        received.sort();
        assert_eq!(received, vec!["1", "1", "2"]);
        for sender in &senders {
            assert_eq!(sender.recv_timeout(BOUND).unwrap(), Ok(()));
        }

        // Close with one sender still pending.
        let senders = [
            spawn_sender(&link, shared.clone()),
            spawn_sender(&link, private),
            spawn_sender(&link, shared),
        ];
        let first = link.receive().unwrap().extract_string().unwrap();
        let second = link.receive().unwrap().extract_string().unwrap();
        link.close();

        let mut pair = vec![first, second];
        pair.sort();
        assert!(pair == vec!["1", "2"] || pair == vec!["1", "1"]);

        let results: Vec<_> = senders
            .iter()
            .map(|s| s.recv_timeout(BOUND).unwrap())
            .collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert_eq!(
            results.iter().filter(|r| **r == Err(LinkError::ClosedChannel)).count(),
            1
        );
    }

    #[test]
    fn test_refcount_and_release() {
        let link = self_link();
        let point = link.point_id();
        assert_eq!(link.ref_count(), 1);

        let copy = link.clone();
        assert_eq!(link.ref_count(), 2);
        assert_eq!(copy.release(), None);
        assert_eq!(link.ref_count(), 1);
        assert!(!reclaim::was_reclaimed(point));

        assert_eq!(link.release(), Some(point));
        assert!(reclaim::was_reclaimed(point));
    }

    #[test]
    fn test_drop_reclaims_point() {
        let link = self_link();
        let point = link.point_id();
        drop(link);
        assert!(reclaim::was_reclaimed(point));
    }

    #[test]
    fn test_isolate_states() {
        let us = Isolate::current();
        let them = Isolate::new("empty");

        assert!(matches!(
            Link::between(&us, &them),
            Err(LinkError::InvalidState {
                state: IsolateState::New,
                ..
            })
        ));
        assert!(matches!(
            Link::between(&them, &us),
            Err(LinkError::InvalidState { .. })
        ));

        them.start().unwrap();
        assert!(Link::between(&us, &them).is_ok());
        assert!(Link::between(&them, &us).is_ok());

        them.terminate();
        assert_eq!(
            Link::between(&us, &them),
            Err(LinkError::InvalidState {
                isolate: them.id(),
                state: IsolateState::Terminated,
            })
        );
        assert!(Link::between(&them, &us).is_err());
    }

    #[test]
    fn test_access_is_directional() {
        let us = Isolate::current();
        let peer = Isolate::started("peer");
        let outbound = Link::between(&us, &peer).unwrap();
        let inbound = Link::between(&peer, &us).unwrap();

        assert_eq!(
            outbound.receive(),
            Err(LinkError::AccessDenied {
                caller: us.id(),
                operation: LinkOperation::Receive,
            })
        );
        assert_eq!(
            inbound.send(&LinkMessage::new_string_message("hello")),
            Err(LinkError::AccessDenied {
                caller: us.id(),
                operation: LinkOperation::Send,
            })
        );
    }

    #[test]
    fn test_third_party_isolate_is_rejected() {
        let a = Isolate::started("a");
        let b = Isolate::started("b");
        let outsider = Isolate::started("outsider");
        let link = Link::between(&a, &b).unwrap();

        let _guard = outsider.enter();
        assert!(matches!(
            link.send(&LinkMessage::new_string_message("x")),
            Err(LinkError::AccessDenied { .. })
        ));
        assert!(matches!(
            link.receive(),
            Err(LinkError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_cross_isolate_transfer() {
        let client = Isolate::started("client");
        let server = Isolate::started("server");
        let link = Link::between(&client, &server).unwrap();

        let receiving = link.clone();
        let handle = server
            .spawn("server-recv", move || receiving.receive())
            .unwrap();

        let _guard = client.enter();
        link.send(&LinkMessage::new_string_message("ping")).unwrap();
        let msg = handle.join().unwrap().unwrap();
        assert_eq!(msg.extract_string().unwrap(), "ping");
    }
}
