//! Alpenhorn Cryptographic Primitives
//!
//! Cryptographic building blocks for the Alpenhorn client. Pure functions and
//! small stateful containers with deterministic outputs; callers provide
//! randomness so tests can be reproducible.
//!
//! # Key Lifecycle
//!
//! Friend discovery and calling derive their keys along two paths:
//!
//! ```text
//! PKG committee shares ── Lagrange ──► round IBE private key
//!        │                                   │
//!        ▼                                   ▼
//! IBE master public key ──► friend-request envelope (encrypt / trial decrypt)
//!
//! X25519 friend agreement ──► keywheel base secret
//!        │
//!        ▼
//! KeyWheel ratchet ──► per-round session keys ──► dial tokens
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Keywheel advancement is one-way; erased rounds are unrecoverable
//! - Old wheel secrets are zeroized when the base moves forward
//!
//! Metadata Privacy:
//! - IBE decryption is trial-based: failure is silent, so mailbox scans do not
//!   reveal which envelopes were addressed to the user
//! - Onions are padded to uniform size per batch

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod dial;
mod ibe;
mod keywheel;
mod onion;

pub use dial::{friend_seed, open_dial_token, seal_dial_token, DIAL_TOKEN_LEN};
pub use ibe::{
    combine_master_public, combine_private_key, decrypt, encrypt, verify_extraction,
    IbeCiphertext, IbeError, IdentityPrivateKey, MasterPublicKey, MasterPublicShare, MasterShare,
    PrivateKeyShare,
};
pub use keywheel::{KeyWheel, KeyWheelError, SESSION_KEY_LEN};
pub use onion::{onion_len, pad_payload, peel_onion, seal_onion, unpad_payload, OnionError};
