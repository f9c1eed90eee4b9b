//! Signed committee configurations and the per-service hash chain.
//!
//! Configs are signed by a guardian set and chained by `PrevConfigHash`. A
//! client only ever advances its stored head through [`SignedConfig::
//! verify_next`], so committee changes are rooted in guardians the client
//! already trusts.
//!
//! # Invariants
//!
//! - The chain is linear: equal-`Created` forks are rejected by strict
//!   monotonicity, and a non-bootstrap config must point at the current head.
//! - A config's hash covers everything except its own signatures.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::wire;

/// Domain separator for config signing and hashing.
const CONFIG_DOMAIN: &[u8] = b"alpenhorn-signed-config-v1";

/// The two coordinator services a client participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceId {
    /// Friend discovery rounds.
    AddFriend,
    /// Call announcement rounds.
    Dialing,
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddFriend => write!(f, "AddFriend"),
            Self::Dialing => write!(f, "Dialing"),
        }
    }
}

/// SHA-256 hash of a config, used as the chain back-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigHash(#[serde(with = "wire::b64_array")] pub [u8; 32]);

impl ConfigHash {
    /// The all-zero hash marking a bootstrap config.
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Whether this is the bootstrap marker.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Short hex form for log and error messages.
    pub fn short_hex(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// A guardian entitled to sign configuration updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Guardian {
    /// Guardian name, used as the signature map key.
    pub username: String,
    /// Guardian's long-term signing key.
    #[serde(with = "wire::b64_verifying_key")]
    pub key: VerifyingKey,
}

/// A PKG server as pinned by a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PkgServerConfig {
    /// Dial address of the PKG.
    pub address: String,
    /// PKG's long-term signing key.
    #[serde(with = "wire::b64_verifying_key")]
    pub key: VerifyingKey,
}

/// A mix server as pinned by a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MixServerConfig {
    /// Dial address of the mix server.
    pub address: String,
    /// Mix server's long-term signing key.
    #[serde(with = "wire::b64_verifying_key")]
    pub key: VerifyingKey,
}

/// The CDN endpoint serving round mailboxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CdnServerConfig {
    /// Dial address of the CDN.
    pub address: String,
    /// CDN's long-term signing key.
    #[serde(with = "wire::b64_verifying_key")]
    pub key: VerifyingKey,
}

/// Service-specific body of a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceConfig {
    /// The PKG committee, in committee order. Empty for the Dialing service.
    #[serde(rename = "PKGServers")]
    pub pkg_servers: Vec<PkgServerConfig>,
    /// The mix chain, in hop order.
    pub mix_servers: Vec<MixServerConfig>,
    /// The mailbox CDN.
    #[serde(rename = "CDNServer")]
    pub cdn_server: CdnServerConfig,
}

/// A signed, chained committee configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignedConfig {
    /// Format version.
    pub version: u32,
    /// Which service this config governs.
    pub service: ServiceId,
    /// Creation time; strictly increasing along the chain.
    pub created: DateTime<Utc>,
    /// Expiry time; strictly after `created`.
    pub expires: DateTime<Utc>,
    /// Hash of the previous config, or all-zero for a bootstrap.
    pub prev_config_hash: ConfigHash,
    /// Guardians whose signatures authorize the next config.
    pub guardians: Vec<Guardian>,
    /// The committee and infrastructure this config pins.
    pub inner: ServiceConfig,
    /// Guardian signatures over [`signing_message`](Self::signing_message),
    /// keyed by guardian username.
    #[serde(default)]
    pub signatures: BTreeMap<String, SignedConfigSignature>,
}

/// One guardian signature inside a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedConfigSignature(#[serde(with = "wire::b64_signature")] pub Signature);

/// Why a config was rejected. Each variant is one of the chain rules, in the
/// order they are checked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Rule 1: a guardian signature is missing or does not verify.
    #[error("missing or invalid signature from guardian {username}")]
    GuardianSignature {
        /// The guardian whose signature failed.
        username: String,
    },

    /// Rule 2: the config is for a different service than the chain.
    #[error("service mismatch: chain is {expected}, config is {actual}")]
    ServiceMismatch {
        /// Service of the chain being updated.
        expected: ServiceId,
        /// Service named by the new config.
        actual: ServiceId,
    },

    /// Rule 3: the back-pointer does not match the stored head.
    #[error("chain broken: prev hash {prev} does not match head {head}")]
    ChainMismatch {
        /// Short hex of the new config's back-pointer.
        prev: String,
        /// Short hex of the stored head's hash.
        head: String,
    },

    /// Rule 4: `Created` is not strictly after the stored head's.
    #[error("config created {created} is not after head created {head_created}")]
    StaleCreated {
        /// New config's creation time.
        created: DateTime<Utc>,
        /// Stored head's creation time.
        head_created: DateTime<Utc>,
    },

    /// Rule 5: `Expires` is not strictly after `Created`.
    #[error("config expires {expires} at or before created {created}")]
    ExpiresBeforeCreated {
        /// New config's expiry time.
        expires: DateTime<Utc>,
        /// New config's creation time.
        created: DateTime<Utc>,
    },

    /// The coordinator served an empty chain.
    #[error("empty config chain")]
    EmptyChain,
}

impl SignedConfig {
    /// SHA-256 hash of the config with its signature map cleared.
    pub fn hash(&self) -> ConfigHash {
        let mut unsigned = self.clone();
        unsigned.signatures.clear();
        let Ok(json) = serde_json::to_vec(&unsigned) else {
            unreachable!("config serialization into a Vec cannot fail");
        };

        let mut hasher = Sha256::new();
        hasher.update(CONFIG_DOMAIN);
        hasher.update(&json);
        ConfigHash(hasher.finalize().into())
    }

    /// Bytes a guardian signs to endorse this config.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(CONFIG_DOMAIN.len() + 32);
        message.extend_from_slice(CONFIG_DOMAIN);
        message.extend_from_slice(&self.hash().0);
        message
    }

    /// Add `guardian`'s signature. Used when publishing a config.
    pub fn sign_by(&mut self, guardian: &str, key: &SigningKey) {
        let signature = key.sign(&self.signing_message());
        self.signatures.insert(guardian.to_string(), SignedConfigSignature(signature));
    }

    /// Verify a bootstrap config against its own guardian set.
    ///
    /// A bootstrap has no earlier config to anchor trust, so the caller must
    /// obtain it out of band; this check only rules out tampering in transit
    /// and storage.
    pub fn verify_bootstrap(&self) -> Result<(), ConfigError> {
        verify_guardians(&self.guardians, self)?;
        if self.expires <= self.created {
            return Err(ConfigError::ExpiresBeforeCreated {
                expires: self.expires,
                created: self.created,
            });
        }
        Ok(())
    }

    /// Verify that `next` is a valid successor of `self`.
    ///
    /// Applies the chain rules in order; the returned error names the first
    /// rule that failed.
    pub fn verify_next(&self, next: &SignedConfig) -> Result<(), ConfigError> {
        verify_guardians(&self.guardians, next)?;

        if next.service != self.service {
            return Err(ConfigError::ServiceMismatch {
                expected: self.service,
                actual: next.service,
            });
        }

        let head_hash = self.hash();
        if next.prev_config_hash != head_hash {
            return Err(ConfigError::ChainMismatch {
                prev: next.prev_config_hash.short_hex(),
                head: head_hash.short_hex(),
            });
        }

        if next.created <= self.created {
            return Err(ConfigError::StaleCreated {
                created: next.created,
                head_created: self.created,
            });
        }

        if next.expires <= next.created {
            return Err(ConfigError::ExpiresBeforeCreated {
                expires: next.expires,
                created: next.created,
            });
        }

        Ok(())
    }

    /// Walk an oldest-to-newest chain from the coordinator, returning the new
    /// head. The chain may begin at the current head itself.
    pub fn advance_chain(&self, chain: &[SignedConfig]) -> Result<SignedConfig, ConfigError> {
        let mut head = self.clone();
        let head_hash = head.hash();
        let mut advanced = false;

        for config in chain {
            if !advanced && config.hash() == head_hash {
                continue;
            }
            head.verify_next(config)?;
            head = config.clone();
            advanced = true;
        }

        if chain.is_empty() {
            return Err(ConfigError::EmptyChain);
        }
        Ok(head)
    }
}

fn verify_guardians(guardians: &[Guardian], config: &SignedConfig) -> Result<(), ConfigError> {
    let message = config.signing_message();
    for guardian in guardians {
        let Some(SignedConfigSignature(signature)) = config.signatures.get(&guardian.username)
        else {
            return Err(ConfigError::GuardianSignature { username: guardian.username.clone() });
        };
        if guardian.key.verify(&message, signature).is_err() {
            return Err(ConfigError::GuardianSignature { username: guardian.username.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use rand::rngs::OsRng;

    use super::*;

    fn guardian_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn test_config(service: ServiceId, guardians: Vec<Guardian>) -> SignedConfig {
        SignedConfig {
            version: 1,
            service,
            created: Utc::now(),
            expires: Utc::now() + TimeDelta::hours(24),
            prev_config_hash: ConfigHash::zero(),
            guardians,
            inner: ServiceConfig {
                pkg_servers: vec![],
                mix_servers: vec![],
                cdn_server: CdnServerConfig {
                    address: "cdn.example.org:8080".into(),
                    key: guardian_key().verifying_key(),
                },
            },
            signatures: BTreeMap::new(),
        }
    }

    fn signed_pair() -> (SigningKey, SignedConfig) {
        let key = guardian_key();
        let guardian = Guardian { username: "guardian".into(), key: key.verifying_key() };
        let mut config = test_config(ServiceId::AddFriend, vec![guardian]);
        config.sign_by("guardian", &key);
        (key, config)
    }

    fn successor(head: &SignedConfig, key: &SigningKey) -> SignedConfig {
        let mut next = head.clone();
        next.signatures.clear();
        next.prev_config_hash = head.hash();
        next.created = head.created + TimeDelta::seconds(5);
        next.expires = next.created + TimeDelta::hours(24);
        next.sign_by("guardian", key);
        next
    }

    #[test]
    fn bootstrap_verifies() {
        let (_, config) = signed_pair();
        config.verify_bootstrap().unwrap();
    }

    #[test]
    fn bootstrap_rejects_unsigned() {
        let (_, mut config) = signed_pair();
        config.signatures.clear();
        assert!(matches!(
            config.verify_bootstrap(),
            Err(ConfigError::GuardianSignature { .. })
        ));
    }

    #[test]
    fn valid_successor_is_accepted() {
        let (key, head) = signed_pair();
        let next = successor(&head, &key);
        head.verify_next(&next).unwrap();
    }

    #[test]
    fn unsigned_successor_is_rejected() {
        let (key, head) = signed_pair();
        let mut next = successor(&head, &key);
        next.signatures.clear();
        assert!(matches!(head.verify_next(&next), Err(ConfigError::GuardianSignature { .. })));
    }

    #[test]
    fn wrong_guardian_key_is_rejected() {
        let (key, head) = signed_pair();
        let mut next = successor(&head, &key);
        next.signatures.clear();
        next.sign_by("guardian", &guardian_key());
        assert!(matches!(head.verify_next(&next), Err(ConfigError::GuardianSignature { .. })));
    }

    #[test]
    fn service_mismatch_is_rejected() {
        let (key, head) = signed_pair();
        let mut next = successor(&head, &key);
        next.signatures.clear();
        next.service = ServiceId::Dialing;
        next.sign_by("guardian", &key);
        assert!(matches!(
            head.verify_next(&next),
            Err(ConfigError::ServiceMismatch { expected: ServiceId::AddFriend, .. })
        ));
    }

    #[test]
    fn broken_back_pointer_is_rejected() {
        let (key, head) = signed_pair();
        let mut next = successor(&head, &key);
        next.signatures.clear();
        next.prev_config_hash = ConfigHash([7u8; 32]);
        next.sign_by("guardian", &key);
        assert!(matches!(head.verify_next(&next), Err(ConfigError::ChainMismatch { .. })));
    }

    #[test]
    fn bootstrap_over_existing_head_is_rejected() {
        let (key, head) = signed_pair();
        let mut next = successor(&head, &key);
        next.signatures.clear();
        next.prev_config_hash = ConfigHash::zero();
        next.sign_by("guardian", &key);
        assert!(matches!(head.verify_next(&next), Err(ConfigError::ChainMismatch { .. })));
    }

    #[test]
    fn equal_created_fork_is_rejected() {
        let (key, head) = signed_pair();
        let mut next = successor(&head, &key);
        next.signatures.clear();
        next.created = head.created;
        next.sign_by("guardian", &key);
        assert!(matches!(head.verify_next(&next), Err(ConfigError::StaleCreated { .. })));
    }

    #[test]
    fn expiry_before_creation_is_rejected() {
        let (key, head) = signed_pair();
        let mut next = successor(&head, &key);
        next.signatures.clear();
        next.expires = next.created - TimeDelta::seconds(1);
        next.sign_by("guardian", &key);
        assert!(matches!(head.verify_next(&next), Err(ConfigError::ExpiresBeforeCreated { .. })));
    }

    #[test]
    fn advance_chain_walks_multiple_configs() {
        let (key, head) = signed_pair();
        let second = successor(&head, &key);
        let third = successor(&second, &key);

        let new_head = head.advance_chain(&[second.clone(), third.clone()]).unwrap();
        assert_eq!(new_head, third);
    }

    #[test]
    fn advance_chain_skips_leading_head_copy() {
        let (key, head) = signed_pair();
        let second = successor(&head, &key);

        let new_head = head.advance_chain(&[head.clone(), second.clone()]).unwrap();
        assert_eq!(new_head, second);
    }

    #[test]
    fn advance_chain_rejects_empty() {
        let (_, head) = signed_pair();
        assert!(matches!(head.advance_chain(&[]), Err(ConfigError::EmptyChain)));
    }

    #[test]
    fn hash_ignores_signatures() {
        let (key, mut config) = signed_pair();
        let before = config.hash();
        config.sign_by("second", &key);
        assert_eq!(config.hash(), before);
    }

    #[test]
    fn json_roundtrip() {
        let (_, config) = signed_pair();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let decoded: SignedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.hash(), config.hash());
    }
}
