//! Alpenhorn wire types.
//!
//! Everything two Alpenhorn endpoints agree on lives here: the signed,
//! hash-chained committee configurations, the PKG request/response api with
//! its error codes, the coordinator round protocol, and the friend-request
//! envelope payload.
//!
//! All JSON-visible binary fields use standard base64 (see [`wire`]) and all
//! timestamps are RFC-3339, matching the persisted client blob format.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod friend;
pub mod pkg;
pub mod round;
pub mod wire;

pub use config::{
    CdnServerConfig, ConfigError, ConfigHash, Guardian, MixServerConfig, PkgServerConfig,
    ServiceConfig, ServiceId, SignedConfig,
};
pub use friend::FriendRequestIntro;
pub use pkg::{
    extract_signing_message, ExtractRequest, ExtractResponse, PkgError, PkgErrorCode,
    RegisterRequest, RegisterResponse,
};
pub use round::{
    append_envelope, mailbox_id, split_envelopes, ClientMessage, CoordinatorMessage,
    MailboxError, RoundAnnouncement, SignedPkgSettings,
};
