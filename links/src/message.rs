//! Link message payloads

use crate::{Link, LinkError};
use std::fmt;

/// Kind of payload a [`LinkMessage`] carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Text,
    Bytes,
    Link,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => write!(f, "string"),
            PayloadKind::Bytes => write!(f, "data"),
            PayloadKind::Link => write!(f, "link"),
        }
    }
}

/// An immutable payload transferred over a link
///
/// Messages own their contents. Constructors copy caller buffers, and every
/// extraction hands back a fresh copy, so neither side can observe the
/// other mutating a buffer after the transfer.
///
/// A link payload carries a handle to another link; transferring it adds a
/// reference to that link's rendezvous point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    Text(String),
    Bytes(Vec<u8>),
    Link(Link),
}

impl LinkMessage {
    /// Creates a string message
    pub fn new_string_message(text: impl Into<String>) -> Self {
        LinkMessage::Text(text.into())
    }

    /// Creates a data message from a copy of `data`
    pub fn new_data_message(data: &[u8]) -> Self {
        LinkMessage::Bytes(data.to_vec())
    }

    /// Creates a data message from `len` bytes of `data` starting at `offset`
    ///
    /// Returns `None` if the range falls outside `data`.
    pub fn new_data_message_range(data: &[u8], offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        data.get(offset..end).map(Self::new_data_message)
    }

    /// Creates a message that transfers `link` to the receiver
    pub fn new_link_message(link: &Link) -> Self {
        LinkMessage::Link(link.clone())
    }

    /// Returns the payload kind
    pub fn kind(&self) -> PayloadKind {
        match self {
            LinkMessage::Text(_) => PayloadKind::Text,
            LinkMessage::Bytes(_) => PayloadKind::Bytes,
            LinkMessage::Link(_) => PayloadKind::Link,
        }
    }

    pub fn contains_string(&self) -> bool {
        self.kind() == PayloadKind::Text
    }

    pub fn contains_data(&self) -> bool {
        self.kind() == PayloadKind::Bytes
    }

    pub fn contains_link(&self) -> bool {
        self.kind() == PayloadKind::Link
    }

    /// Returns a copy of the string payload
    pub fn extract_string(&self) -> Result<String, LinkError> {
        match self {
            LinkMessage::Text(text) => Ok(text.clone()),
            other => Err(other.wrong_payload(PayloadKind::Text)),
        }
    }

    /// Returns a copy of the data payload
    pub fn extract_data(&self) -> Result<Vec<u8>, LinkError> {
        match self {
            LinkMessage::Bytes(data) => Ok(data.clone()),
            other => Err(other.wrong_payload(PayloadKind::Bytes)),
        }
    }

    /// Returns a new handle to the transferred link
    pub fn extract_link(&self) -> Result<Link, LinkError> {
        match self {
            LinkMessage::Link(link) => Ok(link.clone()),
            other => Err(other.wrong_payload(PayloadKind::Link)),
        }
    }

    fn wrong_payload(&self, expected: PayloadKind) -> LinkError {
        LinkError::WrongPayload {
            expected,
            found: self.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate::Isolate;

    #[test]
    fn test_string_message() {
        let msg = LinkMessage::new_string_message("hello");
        assert!(msg.contains_string());
        assert!(!msg.contains_data());
        assert!(!msg.contains_link());
        assert_eq!(msg.extract_string().unwrap(), "hello");
    }

    #[test]
    fn test_data_message_copies_buffer() {
        let mut buffer = vec![1u8, 2, 3];
        let msg = LinkMessage::new_data_message(&buffer);
        buffer[0] = 99;

        let extracted = msg.extract_data().unwrap();
        assert_eq!(extracted, vec![1, 2, 3]);
    }

    #[test]
    fn test_data_message_range() {
        let data = [10u8, 20, 30, 40];
        let msg = LinkMessage::new_data_message_range(&data, 1, 2).unwrap();
        assert_eq!(msg.extract_data().unwrap(), vec![20, 30]);

        assert!(LinkMessage::new_data_message_range(&data, 3, 2).is_none());
        assert!(LinkMessage::new_data_message_range(&data, usize::MAX, 2).is_none());
    }

    #[test]
    fn test_link_message_adds_reference() {
        let here = Isolate::current();
        let link = Link::between(&here, &here).unwrap();
        assert_eq!(link.ref_count(), 1);

        let msg = LinkMessage::new_link_message(&link);
        assert_eq!(link.ref_count(), 2);

        let extracted = msg.extract_link().unwrap();
        assert_eq!(extracted, link);
        assert_eq!(link.ref_count(), 3);

        drop(msg);
        drop(extracted);
        assert_eq!(link.ref_count(), 1);
    }

    #[test]
    fn test_wrong_payload_extraction() {
        let msg = LinkMessage::new_string_message("text");
        assert_eq!(
            msg.extract_data(),
            Err(LinkError::WrongPayload {
                expected: PayloadKind::Bytes,
                found: PayloadKind::Text,
            })
        );
        assert!(matches!(
            msg.extract_link(),
            Err(LinkError::WrongPayload {
                expected: PayloadKind::Link,
                ..
            })
        ));
    }
}
