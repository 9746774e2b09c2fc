//! Mailbox: the source of per-type receive queues.

use crate::queue::{QueueError, ReceiveQueue};
use crate::{DispatchError, Envelope};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Supplies the receive queue backing each message type
///
/// The dispatcher only ever asks for queues; whoever implements this trait
/// decides how messages reach them.
pub trait ReceiveQueueFactory: Send + Sync {
    /// Returns the queue for `message_type`, creating it if needed
    fn queue_for(&self, message_type: &str) -> Arc<ReceiveQueue>;
}

/// In-process queue factory that also lets collaborators post messages
///
/// Queues are created on first use and live as long as the mailbox, so
/// messages posted before anyone registers for their type are buffered.
#[derive(Clone)]
pub struct Mailbox {
    capacity: usize,
    queues: Arc<Mutex<HashMap<String, Arc<ReceiveQueue>>>>,
}

impl Mailbox {
    /// Creates a mailbox whose queues hold at most `capacity` messages each
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Routes `envelope` to the queue for its message type
    pub fn post(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let message_type = envelope.message_type.clone();
        self.queue_for(&message_type)
            .push(envelope)
            .map_err(|e| match e {
                QueueError::Full => DispatchError::QueueFull(message_type),
                QueueError::Closed | QueueError::TimedOut => DispatchError::Closed,
            })
    }

    /// Number of messages waiting for `message_type`
    pub fn pending(&self, message_type: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(message_type)
            .map_or(0, |q| q.len())
    }

    /// Closes every queue, waking all blocked receivers
    pub fn close(&self) {
        for queue in self
            .queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
        {
            queue.close();
        }
    }
}

impl ReceiveQueueFactory for Mailbox {
    fn queue_for(&self, message_type: &str) -> Arc<ReceiveQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            queues
                .entry(message_type.to_string())
                .or_insert_with(|| {
                    Arc::new(ReceiveQueue::with_capacity(message_type, self.capacity))
                }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use links::LinkMessage;

    #[test]
    fn test_queue_for_is_stable() {
        let mailbox = Mailbox::new(4);
        let a = mailbox.queue_for("x");
        let b = mailbox.queue_for("x");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.message_type(), "x");
        assert_eq!(a.capacity(), 4);
    }

    #[test]
    fn test_post_buffers_until_consumed() {
        let mailbox = Mailbox::new(4);
        mailbox
            .post(Envelope::new("x", LinkMessage::new_string_message("hi")))
            .unwrap();
        assert_eq!(mailbox.pending("x"), 1);
        assert_eq!(mailbox.pending("y"), 0);

        let env = mailbox.queue_for("x").try_receive().unwrap();
        assert_eq!(env.payload.extract_string().unwrap(), "hi");
    }

    #[test]
    fn test_post_to_full_queue() {
        let mailbox = Mailbox::new(1);
        mailbox
            .post(Envelope::new("x", LinkMessage::new_string_message("1")))
            .unwrap();
        assert_eq!(
            mailbox.post(Envelope::new("x", LinkMessage::new_string_message("2"))),
            Err(DispatchError::QueueFull("x".to_string()))
        );
    }

    #[test]
    fn test_post_after_close() {
        let mailbox = Mailbox::new(1);
        let _ = mailbox.queue_for("x");
        mailbox.close();
        assert_eq!(
            mailbox.post(Envelope::new("x", LinkMessage::new_string_message("1"))),
            Err(DispatchError::Closed)
        );
    }
}
