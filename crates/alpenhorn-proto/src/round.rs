//! The coordinator round protocol and mailbox framing.
//!
//! A round session is one long-lived stream per service. The coordinator
//! announces rounds, the client submits an onion batch before the deadline,
//! and after mixing the coordinator signals that round mailboxes are
//! available on the CDN.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    config::{ConfigHash, ServiceId},
    wire,
};

/// Domain separator for PKG round settings signatures.
const PKG_SETTINGS_DOMAIN: &[u8] = b"alpenhorn-pkg-settings";

/// One PKG's round master public share, signed by its long-term key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignedPkgSettings {
    /// 1-based committee position.
    pub index: u32,
    /// Compressed G2 master public share for this round.
    #[serde(with = "wire::b64")]
    pub master_share: Vec<u8>,
    /// Signature over [`pkg_settings_message`] by the PKG's long-term key.
    #[serde(with = "wire::b64_signature")]
    pub signature: Signature,
}

impl SignedPkgSettings {
    /// Build and sign settings for one round.
    pub fn sign(
        service: ServiceId,
        round: u32,
        index: u32,
        master_share: Vec<u8>,
        key: &SigningKey,
    ) -> Self {
        let signature = key.sign(&pkg_settings_message(service, round, index, &master_share));
        Self { index, master_share, signature }
    }

    /// Verify the settings against the PKG's pinned key.
    pub fn verify(&self, service: ServiceId, round: u32, key: &VerifyingKey) -> bool {
        let message = pkg_settings_message(service, round, self.index, &self.master_share);
        key.verify(&message, &self.signature).is_ok()
    }
}

/// Bytes a PKG signs to publish its round master public share.
fn pkg_settings_message(service: ServiceId, round: u32, index: u32, share: &[u8]) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(PKG_SETTINGS_DOMAIN);
    message.extend_from_slice(service.to_string().as_bytes());
    message.extend_from_slice(&round.to_be_bytes());
    message.extend_from_slice(&index.to_be_bytes());
    message.extend_from_slice(share);
    message
}

/// A coordinator's announcement of a new round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoundAnnouncement {
    /// Service this round belongs to.
    pub service: ServiceId,
    /// Round number, strictly increasing per service.
    pub round: u32,
    /// Hash of the config the coordinator is operating under.
    pub config_hash: ConfigHash,
    /// Fresh per-round onion keys, one per mix hop in chain order.
    #[serde(with = "wire::b64_array_vec")]
    pub onion_keys: Vec<[u8; 32]>,
    /// Round key material from each committee PKG. Empty for Dialing.
    #[serde(rename = "PKGSettings")]
    pub pkg_settings: Vec<SignedPkgSettings>,
    /// Number of CDN mailboxes for this round.
    pub num_mailboxes: u32,
    /// Milliseconds the coordinator waits for submissions.
    pub submit_window_ms: u64,
}

/// Messages the coordinator sends on a round session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorMessage {
    /// A new round is open for submissions.
    NewRound(RoundAnnouncement),
    /// Mixing finished; the round's mailboxes are on the CDN.
    MailboxReady {
        /// The round whose mailboxes are available.
        round: u32,
    },
}

/// Messages the client sends on a round session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// The client's onion batch for a round.
    Onions {
        /// Round the batch belongs to.
        round: u32,
        /// Sealed onions, uniform size.
        #[serde(with = "wire::b64_vec")]
        onions: Vec<Vec<u8>>,
    },
}

/// Errors from mailbox blob parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// A length prefix points past the end of the blob.
    #[error("mailbox blob truncated")]
    Truncated,
}

/// Deterministic mailbox slot for a username.
pub fn mailbox_id(username: &str, num_mailboxes: u32) -> u32 {
    let digest = Sha256::digest(username.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    n % num_mailboxes.max(1)
}

/// Append one envelope to a mailbox blob (`len: u32 BE || envelope`).
pub fn append_envelope(blob: &mut Vec<u8>, envelope: &[u8]) {
    blob.extend_from_slice(&(envelope.len() as u32).to_be_bytes());
    blob.extend_from_slice(envelope);
}

/// Split a mailbox blob into its envelopes.
pub fn split_envelopes(blob: &[u8]) -> Result<Vec<Vec<u8>>, MailboxError> {
    let mut envelopes = Vec::new();
    let mut rest = blob;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(MailboxError::Truncated);
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(MailboxError::Truncated);
        }
        envelopes.push(rest[..len].to_vec());
        rest = &rest[len..];
    }
    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn pkg_settings_verify_roundtrip() {
        let key = SigningKey::generate(&mut OsRng);
        let settings =
            SignedPkgSettings::sign(ServiceId::AddFriend, 5, 2, vec![1, 2, 3], &key);

        assert!(settings.verify(ServiceId::AddFriend, 5, &key.verifying_key()));
        assert!(!settings.verify(ServiceId::AddFriend, 6, &key.verifying_key()));
        assert!(!settings.verify(ServiceId::Dialing, 5, &key.verifying_key()));

        let other = SigningKey::generate(&mut OsRng);
        assert!(!settings.verify(ServiceId::AddFriend, 5, &other.verifying_key()));
    }

    #[test]
    fn mailbox_id_is_stable_and_bounded() {
        let id = mailbox_id("alice@example.org", 8);
        assert_eq!(mailbox_id("alice@example.org", 8), id);
        assert!(id < 8);
    }

    #[test]
    fn mailbox_id_handles_zero_mailboxes() {
        assert_eq!(mailbox_id("alice@example.org", 0), 0);
    }

    #[test]
    fn envelope_framing_roundtrip() {
        let mut blob = Vec::new();
        append_envelope(&mut blob, b"first");
        append_envelope(&mut blob, b"");
        append_envelope(&mut blob, &[9u8; 300]);

        let envelopes = split_envelopes(&blob).unwrap();
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[0], b"first");
        assert_eq!(envelopes[1], b"");
        assert_eq!(envelopes[2], vec![9u8; 300]);
    }

    #[test]
    fn split_rejects_truncated_blob() {
        let mut blob = Vec::new();
        append_envelope(&mut blob, b"payload");
        blob.truncate(blob.len() - 2);
        assert_eq!(split_envelopes(&blob), Err(MailboxError::Truncated));
    }

    #[test]
    fn announcement_json_roundtrip() {
        let key = SigningKey::generate(&mut OsRng);
        let announcement = RoundAnnouncement {
            service: ServiceId::AddFriend,
            round: 12,
            config_hash: ConfigHash([3u8; 32]),
            onion_keys: vec![[1u8; 32], [2u8; 32]],
            pkg_settings: vec![SignedPkgSettings::sign(
                ServiceId::AddFriend,
                12,
                1,
                vec![5, 6],
                &key,
            )],
            num_mailboxes: 4,
            submit_window_ms: 1000,
        };

        let json = serde_json::to_string(&announcement).unwrap();
        let decoded: RoundAnnouncement = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, announcement);
    }
}
