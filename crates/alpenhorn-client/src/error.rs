//! Error types for the client core.
//!
//! One category per failure domain. Round-loop errors are reported through
//! the [`EventHandler::error`](crate::EventHandler::error) callback and
//! abandon the round; API-boundary errors are returned synchronously.

use alpenhorn_crypto::KeyWheelError;
use alpenhorn_proto::{ConfigError, PkgError};
use thiserror::Error;

/// Top-level client error categories.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A config failed verification or chain advancement.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Persisting or loading client state failed.
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),

    /// A network operation failed or timed out.
    #[error("network error: {0}")]
    Network(String),

    /// Key material failed to combine, verify, or decode.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A peer or server violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A PKG rejected the request.
    #[error(transparent)]
    Pkg(#[from] PkgError),

    /// The client has been closed.
    #[error("client is closed")]
    Closed,
}

/// Errors from persisting or restoring the two state blobs.
#[derive(Error, Debug)]
pub enum PersistError {
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The client blob failed to (de)serialize.
    #[error("client blob: {0}")]
    Json(#[from] serde_json::Error),

    /// The keywheel blob failed to (de)serialize.
    #[error("keywheel blob: {0}")]
    Keywheel(#[from] KeyWheelError),

    /// A stored config no longer verifies.
    #[error("stored config failed verification: {0}")]
    ConfigIntegrity(ConfigError),

    /// Persist was requested before the client was bootstrapped.
    #[error("client has no configs to persist; bootstrap first")]
    NotBootstrapped,

    /// A stored key is inconsistent with the rest of the blob.
    #[error("stored key material is inconsistent: {0}")]
    BadKey(String),
}
