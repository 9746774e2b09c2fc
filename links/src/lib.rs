//! # Links
//!
//! This crate defines the inter-isolate channel primitive.
//!
//! ## Philosophy
//!
//! - **Rendezvous, not buffering**: A send completes only when a receiver takes the message
//! - **Copies, not references**: Everything crossing the boundary is owned by the receiver
//! - **Cancellation is distinguishable**: Closing a link fails blocked operations with
//!   [`LinkError::ClosedChannel`], never a generic error and never a hang
//! - **Deterministic reclamation**: Points are freed with their last handle, and the
//!   [`reclaim`] log makes that observable to tests
//!
//! ## Architecture
//!
//! A [`Link`] is a handle bound to a sender isolate and a receiver isolate. All
//! handles of one link share a [`RendezvousPoint`], which pairs at most one
//! parked sender with at most one active receiver at a time.

pub mod error;
pub mod link;
pub mod message;
pub mod point;
pub mod reclaim;

pub use error::{LinkError, LinkOperation};
pub use link::{Link, CLOSED_LINK_HASH};
pub use message::{LinkMessage, PayloadKind};
pub use point::RendezvousPoint;
