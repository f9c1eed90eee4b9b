//! Alpenhorn client core.
//!
//! Metadata-private friend discovery and call initiation against a
//! coordinator and a PKG committee. The client keeps a durable record of its
//! identity, configs, in-flight friend requests, and per-friend keywheel,
//! and drives two round state machines: add-friend (IBE-encrypted friend
//! requests through a mix net) and dialing (keywheel-sealed call tokens).
//!
//! # Architecture
//!
//! - One exclusive lock guards all mutable state. The lock is never held
//!   across I/O: engines snapshot under the lock, do network work, then
//!   re-acquire and reconcile.
//! - Everything durable flushes through two blobs written together: a JSON
//!   client blob and a binary keywheel blob. An outgoing request is durable
//!   as sent *before* its onion reaches the network, so a crash cannot
//!   duplicate a request.
//! - The coordinator, PKGs, and CDN sit behind async traits ([`network`]);
//!   transport security is the caller's concern.
//! - Application callbacks ([`EventHandler`]) are invoked with the lock
//!   released and strictly in round order.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod addfriend;
mod client;
mod dialing;
mod error;
mod handler;
pub mod network;
mod persist;
mod pkg_client;
mod state;

pub use client::{Client, Identity};
pub use error::{ClientError, PersistError};
pub use handler::{
    EventHandler, Friend, IncomingCall, IncomingFriendRequest, OutgoingCall, OutgoingFriendRequest,
};
pub use network::{CoordinatorConnector, MailboxFetcher, Network, PkgConnector, RoundSession};
