//! PKG request/response types and the PKG error taxonomy.
//!
//! A client registers its login key with each PKG once, then proves
//! possession of that key every round to extract its identity key share.
//! Responses are signed by the PKG's long-term key so a compromised channel
//! cannot substitute shares.

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{config::ServiceId, wire};

/// Domain separator for the extract challenge signed by the login key.
const EXTRACT_DOMAIN: &[u8] = b"alpenhorn-pkg-extract";

/// Domain separator for PKG-signed extract responses.
const EXTRACT_REPLY_DOMAIN: &[u8] = b"alpenhorn-pkg-extract-reply";

/// Error codes a PKG can return.
///
/// The numeric values and names are fixed by the wire protocol; `as_str` and
/// `from_str` round-trip every code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkgErrorCode {
    /// Request body was not valid JSON.
    BadRequestJSON,
    /// PKG-side storage failure.
    DatabaseError,
    /// Username is not a well-formed address.
    InvalidUsername,
    /// Login key is malformed.
    InvalidLoginKey,
    /// The username has not been registered.
    NotRegistered,
    /// Registration exists but has not been verified.
    NotVerified,
    /// The username is already registered.
    AlreadyRegistered,
    /// A registration for the username is still pending.
    RegistrationInProgress,
    /// Verification email could not be sent.
    SendingEmail,
    /// The PKG has no key material for the requested round.
    RoundNotFound,
    /// The long-term key on file does not match.
    InvalidUserLongTermKey,
    /// A signature in the request failed to verify.
    InvalidSignature,
    /// The registration token is invalid.
    InvalidToken,
    /// The registration token has expired.
    ExpiredToken,
    /// The caller is not allowed to perform the operation.
    Unauthorized,
    /// The registration commitment does not match.
    BadCommitment,
    /// Anything the protocol does not name.
    Unknown,
}

impl PkgErrorCode {
    /// Wire name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequestJSON => "BadRequestJSON",
            Self::DatabaseError => "DatabaseError",
            Self::InvalidUsername => "InvalidUsername",
            Self::InvalidLoginKey => "InvalidLoginKey",
            Self::NotRegistered => "NotRegistered",
            Self::NotVerified => "NotVerified",
            Self::AlreadyRegistered => "AlreadyRegistered",
            Self::RegistrationInProgress => "RegistrationInProgress",
            Self::SendingEmail => "SendingEmail",
            Self::RoundNotFound => "RoundNotFound",
            Self::InvalidUserLongTermKey => "InvalidUserLongTermKey",
            Self::InvalidSignature => "InvalidSignature",
            Self::InvalidToken => "InvalidToken",
            Self::ExpiredToken => "ExpiredToken",
            Self::Unauthorized => "Unauthorized",
            Self::BadCommitment => "BadCommitment",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::str::FromStr for PkgErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BadRequestJSON" => Self::BadRequestJSON,
            "DatabaseError" => Self::DatabaseError,
            "InvalidUsername" => Self::InvalidUsername,
            "InvalidLoginKey" => Self::InvalidLoginKey,
            "NotRegistered" => Self::NotRegistered,
            "NotVerified" => Self::NotVerified,
            "AlreadyRegistered" => Self::AlreadyRegistered,
            "RegistrationInProgress" => Self::RegistrationInProgress,
            "SendingEmail" => Self::SendingEmail,
            "RoundNotFound" => Self::RoundNotFound,
            "InvalidUserLongTermKey" => Self::InvalidUserLongTermKey,
            "InvalidSignature" => Self::InvalidSignature,
            "InvalidToken" => Self::InvalidToken,
            "ExpiredToken" => Self::ExpiredToken,
            "Unauthorized" => Self::Unauthorized,
            "BadCommitment" => Self::BadCommitment,
            _ => Self::Unknown,
        })
    }
}

impl std::fmt::Display for PkgErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error returned by a PKG.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("pkg error {code}: {message}")]
pub struct PkgError {
    /// Machine-readable error code.
    pub code: PkgErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl PkgError {
    /// Build an error with the given code and message.
    pub fn new(code: PkgErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// One-time registration of a login key for a username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterRequest {
    /// Address-like username being registered.
    pub username: String,
    /// Public half of the client's PKG login key.
    #[serde(with = "wire::b64_verifying_key")]
    pub login_key: VerifyingKey,
    /// Optional registration token for closed deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Acknowledgement of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterResponse {
    /// Username the registration was recorded for.
    pub username: String,
}

/// Per-round identity-key extraction, authenticated by the login key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtractRequest {
    /// Round the key is requested for.
    pub round: u32,
    /// Username whose identity key is extracted.
    pub username: String,
    /// Login-key signature over [`extract_signing_message`].
    #[serde(with = "wire::b64_signature")]
    pub signature: Signature,
}

/// A PKG's answer to an [`ExtractRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtractResponse {
    /// Round the shares belong to.
    pub round: u32,
    /// Username the key share was extracted for.
    pub username: String,
    /// 1-based committee position of the answering PKG.
    pub index: u32,
    /// This PKG's share of the user's round identity key (compressed G1).
    #[serde(with = "wire::b64")]
    pub key_share: Vec<u8>,
    /// This PKG's round master public share (compressed G2).
    #[serde(with = "wire::b64")]
    pub master_share: Vec<u8>,
    /// PKG long-term-key signature over [`ExtractResponse::signing_message`].
    #[serde(with = "wire::b64_signature")]
    pub signature: Signature,
}

impl ExtractResponse {
    /// Bytes the PKG signs to bind its shares to the request.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(EXTRACT_REPLY_DOMAIN);
        message.extend_from_slice(&self.round.to_be_bytes());
        message.extend_from_slice(&self.index.to_be_bytes());
        message.extend_from_slice(&(self.username.len() as u16).to_be_bytes());
        message.extend_from_slice(self.username.as_bytes());
        message.extend_from_slice(&(self.key_share.len() as u16).to_be_bytes());
        message.extend_from_slice(&self.key_share);
        message.extend_from_slice(&(self.master_share.len() as u16).to_be_bytes());
        message.extend_from_slice(&self.master_share);
        message
    }
}

/// Challenge bytes a client signs with its login key to extract at `round`.
pub fn extract_signing_message(service: ServiceId, round: u32, username: &str) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(EXTRACT_DOMAIN);
    message.extend_from_slice(service.to_string().as_bytes());
    message.extend_from_slice(&round.to_be_bytes());
    message.extend_from_slice(username.as_bytes());
    message
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    const ALL_CODES: [PkgErrorCode; 17] = [
        PkgErrorCode::BadRequestJSON,
        PkgErrorCode::DatabaseError,
        PkgErrorCode::InvalidUsername,
        PkgErrorCode::InvalidLoginKey,
        PkgErrorCode::NotRegistered,
        PkgErrorCode::NotVerified,
        PkgErrorCode::AlreadyRegistered,
        PkgErrorCode::RegistrationInProgress,
        PkgErrorCode::SendingEmail,
        PkgErrorCode::RoundNotFound,
        PkgErrorCode::InvalidUserLongTermKey,
        PkgErrorCode::InvalidSignature,
        PkgErrorCode::InvalidToken,
        PkgErrorCode::ExpiredToken,
        PkgErrorCode::Unauthorized,
        PkgErrorCode::BadCommitment,
        PkgErrorCode::Unknown,
    ];

    #[test]
    fn error_codes_roundtrip_their_names() {
        for code in ALL_CODES {
            assert_eq!(PkgErrorCode::from_str(code.as_str()), Ok(code));
        }
    }

    #[test]
    fn unrecognized_code_maps_to_unknown() {
        assert_eq!(PkgErrorCode::from_str("SomethingNew"), Ok(PkgErrorCode::Unknown));
    }

    #[test]
    fn extract_challenge_binds_service_round_and_user() {
        let a = extract_signing_message(ServiceId::AddFriend, 7, "alice@example.org");
        let b = extract_signing_message(ServiceId::AddFriend, 8, "alice@example.org");
        let c = extract_signing_message(ServiceId::AddFriend, 7, "bob@example.org");
        let d = extract_signing_message(ServiceId::Dialing, 7, "alice@example.org");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn pkg_error_display() {
        let err = PkgError::new(PkgErrorCode::AlreadyRegistered, "alice@example.org");
        assert_eq!(err.to_string(), "pkg error AlreadyRegistered: alice@example.org");
    }
}
