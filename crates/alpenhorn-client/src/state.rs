//! In-memory client state and the request records it tracks.
//!
//! Everything here lives under the client's single lock. The serde shapes of
//! the records double as their persisted form inside the client blob; fields
//! that only steer in-memory behavior are skipped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use alpenhorn_crypto::KeyWheel;
use alpenhorn_proto::{wire, ConfigHash, PkgServerConfig, ServiceId, SignedConfig};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

/// How many dialing rounds ahead a new friend request proposes to start the
/// keywheel. Gives both sides time to confirm before the first dialable
/// round.
pub(crate) const DIAL_ROUND_LEAD: u32 = 4;

/// `x25519_dalek::StaticSecret` as a base64 string of its 32 bytes.
pub(crate) mod dh_secret {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::*;

    pub fn serialize<S: Serializer>(secret: &StaticSecret, ser: S) -> Result<S::Ok, S::Error> {
        wire::b64_array::serialize(&secret.to_bytes(), ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<StaticSecret, D::Error> {
        let bytes = wire::b64_array::deserialize(de)?;
        Ok(StaticSecret::from(bytes))
    }
}

/// A friend request the user has queued but not yet submitted to a round.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct OutgoingRecord {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_key: Option<ExpectedKey>,
    #[serde(rename = "DHPublic", with = "wire::b64_array")]
    pub dh_public: [u8; 32],
    #[serde(rename = "DHPrivate", with = "dh_secret")]
    pub dh_private: StaticSecret,
    pub dial_round: u32,
}

/// A pinned long-term key on an outgoing request.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub(crate) struct ExpectedKey(#[serde(with = "wire::b64_verifying_key")] pub VerifyingKey);

/// An outgoing request that has been submitted to a round. Retains the
/// committee used so the partner's answer can be judged against it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SentRecord {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_key: Option<ExpectedKey>,
    #[serde(rename = "DHPublic", with = "wire::b64_array")]
    pub dh_public: [u8; 32],
    #[serde(rename = "DHPrivate", with = "dh_secret")]
    pub dh_private: StaticSecret,
    pub dial_round: u32,
    pub round: u32,
    pub committee: Vec<PkgServerConfig>,
}

/// A friend request decrypted from a mailbox.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct IncomingRecord {
    pub username: String,
    #[serde(with = "wire::b64_verifying_key")]
    pub long_term_key: VerifyingKey,
    #[serde(rename = "DHPublic", with = "wire::b64_array")]
    pub dh_public: [u8; 32],
    pub dial_round: u32,
    pub round: u32,
    /// The PKG committee as of the round the request arrived in.
    pub verifiers: Vec<PkgServerConfig>,
    #[serde(with = "wire::b64_array")]
    pub envelope_digest: [u8; 32],
    /// A pin mismatch was already reported for this record.
    #[serde(skip)]
    pub warned: bool,
}

/// A confirmed contact as persisted in the friend map.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct FriendRecord {
    pub username: String,
    #[serde(with = "wire::b64_verifying_key")]
    pub long_term_key: VerifyingKey,
    #[serde(with = "wire::b64")]
    pub extra_data: Vec<u8>,
}

/// A call the user has asked for, waiting for a dialing round it is
/// actionable in. In-memory only; calls do not survive a restart.
#[derive(Clone)]
pub(crate) struct PendingCall {
    pub username: String,
    pub intent: u8,
}

/// A verified config head and its cached hash.
#[derive(Clone)]
pub(crate) struct ConfigState {
    pub config: SignedConfig,
    pub hash: ConfigHash,
}

impl ConfigState {
    pub fn new(config: SignedConfig) -> Self {
        let hash = config.hash();
        Self { config, hash }
    }
}

/// All mutable client state, guarded by the client's single lock.
pub(crate) struct ClientState {
    pub client_persist_path: Option<PathBuf>,
    pub keywheel_persist_path: Option<PathBuf>,

    pub addfriend: Option<ConfigState>,
    pub dialing: Option<ConfigState>,

    pub incoming: Vec<IncomingRecord>,
    pub outgoing: Vec<OutgoingRecord>,
    pub sent: Vec<SentRecord>,
    pub friends: BTreeMap<String, FriendRecord>,
    pub wheel: KeyWheel,

    pub pending_calls: Vec<PendingCall>,
    pub last_round: HashMap<ServiceId, u32>,
    pub seen_envelopes: HashSet<[u8; 32]>,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            client_persist_path: None,
            keywheel_persist_path: None,
            addfriend: None,
            dialing: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            sent: Vec::new(),
            friends: BTreeMap::new(),
            wheel: KeyWheel::new(),
            pending_calls: Vec::new(),
            last_round: HashMap::new(),
            seen_envelopes: HashSet::new(),
        }
    }

    /// The stored config head for `service`, if bootstrapped.
    pub fn config(&self, service: ServiceId) -> Option<&ConfigState> {
        match service {
            ServiceId::AddFriend => self.addfriend.as_ref(),
            ServiceId::Dialing => self.dialing.as_ref(),
        }
    }

    /// Replace the stored config head for `service`.
    pub fn set_config(&mut self, service: ServiceId, config: SignedConfig) {
        let slot = match service {
            ServiceId::AddFriend => &mut self.addfriend,
            ServiceId::Dialing => &mut self.dialing,
        };
        *slot = Some(ConfigState::new(config));
    }

    /// The dialing round a fresh friend request should synchronize on.
    pub fn next_dial_round(&self) -> u32 {
        self.last_round.get(&ServiceId::Dialing).copied().unwrap_or(0) + DIAL_ROUND_LEAD
    }
}
