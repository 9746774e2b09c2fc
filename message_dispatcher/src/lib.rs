//! # Message Dispatcher
//!
//! Routes typed messages arriving at an isolate to whoever asked for them.
//!
//! ## Philosophy
//!
//! - **One owner per type**: a message type is either polled directly or
//!   fanned out to handlers, never both
//! - **Handlers are isolated from each other**: a failing handler is logged
//!   and the rest still run
//! - **Queues are pluggable**: the dispatcher consumes queues from a
//!   [`ReceiveQueueFactory`] and never decides how messages arrive
//!
//! ## Example
//!
//! ```no_run
//! use links::LinkMessage;
//! use message_dispatcher::{DispatcherConfig, Envelope, Mailbox, MessageDispatcher};
//!
//! let mailbox = Mailbox::new(16);
//! let dispatcher = MessageDispatcher::with_mailbox(&mailbox, DispatcherConfig::default());
//!
//! dispatcher.register_direct("ping").unwrap();
//! mailbox
//!     .post(Envelope::new("ping", LinkMessage::new_string_message("hi")))
//!     .unwrap();
//! let envelope = dispatcher.wait_for_message("ping", None).unwrap();
//! assert_eq!(envelope.payload.extract_string().unwrap(), "hi");
//! ```

pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod mailbox;
pub mod queue;

pub use config::DispatcherConfig;
pub use dispatcher::{MessageDispatcher, MessageHandler, Registration};
pub use envelope::Envelope;
pub use error::{DispatchError, HandlerError};
pub use mailbox::{Mailbox, ReceiveQueueFactory};
pub use queue::{QueueError, ReceiveQueue};
