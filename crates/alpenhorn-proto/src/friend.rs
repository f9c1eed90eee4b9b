//! The friend-request envelope payload.
//!
//! This is the innermost plaintext of an add-friend onion: who is asking,
//! their long-term key, an ephemeral DH public for the keywheel, and the
//! dialing round the new friendship synchronizes on. The sender signs it so
//! the receiver can pin the claimed long-term key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::wire;

/// Domain separator for intro signatures.
const INTRO_DOMAIN: &[u8] = b"alpenhorn-friend-intro";

/// A signed friend-request introduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FriendRequestIntro {
    /// Sender's username.
    pub username: String,
    /// Sender's long-term signing key.
    #[serde(with = "wire::b64_verifying_key")]
    pub long_term_key: VerifyingKey,
    /// Sender's ephemeral X25519 public key.
    #[serde(rename = "DHPublic", with = "wire::b64_array")]
    pub dh_public: [u8; 32],
    /// Dialing round the friendship's keywheel starts at.
    pub dial_round: u32,
    /// Signature over the other fields by `long_term_key`.
    #[serde(with = "wire::b64_signature")]
    pub signature: Signature,
}

impl FriendRequestIntro {
    /// Build and sign an intro with the sender's long-term key.
    pub fn sign(
        username: String,
        long_term: &SigningKey,
        dh_public: [u8; 32],
        dial_round: u32,
    ) -> Self {
        let long_term_key = long_term.verifying_key();
        let message = signing_message(&username, &long_term_key, &dh_public, dial_round);
        let signature = long_term.sign(&message);
        Self { username, long_term_key, dh_public, dial_round, signature }
    }

    /// Verify the signature against the embedded long-term key.
    pub fn verify(&self) -> bool {
        let message =
            signing_message(&self.username, &self.long_term_key, &self.dh_public, self.dial_round);
        self.long_term_key.verify(&message, &self.signature).is_ok()
    }

    /// Serialize for envelope encryption.
    pub fn encode(&self) -> Vec<u8> {
        let Ok(bytes) = serde_json::to_vec(self) else {
            unreachable!("intro serialization into a Vec cannot fail");
        };
        bytes
    }

    /// Parse an intro from a decrypted envelope.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

fn signing_message(
    username: &str,
    long_term_key: &VerifyingKey,
    dh_public: &[u8; 32],
    dial_round: u32,
) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(INTRO_DOMAIN);
    message.extend_from_slice(&(username.len() as u16).to_be_bytes());
    message.extend_from_slice(username.as_bytes());
    message.extend_from_slice(long_term_key.as_bytes());
    message.extend_from_slice(dh_public);
    message.extend_from_slice(&dial_round.to_be_bytes());
    message
}
