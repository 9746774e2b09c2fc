//! Typed message envelope routed by the dispatcher

use core_types::{IsolateId, MessageId};
use links::LinkMessage;

/// A message tagged with the type the dispatcher routes on
///
/// The payload is the same immutable [`LinkMessage`] that travels over
/// links, so handlers can forward it without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Unique identifier for this message
    pub id: MessageId,
    /// Routing key
    pub message_type: String,
    /// Originating isolate, if known
    pub source: Option<IsolateId>,
    /// Message body
    pub payload: LinkMessage,
}

impl Envelope {
    /// Creates a new envelope
    pub fn new(message_type: impl Into<String>, payload: LinkMessage) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            source: None,
            payload,
        }
    }

    /// Sets the originating isolate
    pub fn with_source(mut self, source: IsolateId) -> Self {
        self.source = Some(source);
        self
    }
}
