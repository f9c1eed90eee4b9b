//! Per-friend forward-secret key ratchet.
//!
//! Each friend has exactly one wheel entry: a 32-byte secret and the round it
//! is valid for. Advancing by one round applies a one-way function; session
//! keys are derived under a separate label so handing out a session key never
//! reveals wheel state.
//!
//! # Security Properties
//!
//! - Forward Secrecy: erasing up to a round destroys all earlier secrets
//! - Determinism: the same base always yields the same session keys
//! - Isolation: the session-key label is disjoint from the step label

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Label for advancing the wheel by one round.
const STEP_LABEL: &[u8] = b"wheel";

/// Label for deriving a session key from a wheel secret.
const SESSION_LABEL: &[u8] = b"session";

/// Blob format version written by [`KeyWheel::marshal`].
const WHEEL_VERSION: u8 = 1;

/// Size of a derived session key in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Errors from keywheel operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyWheelError {
    /// An entry for the username already exists.
    #[error("keywheel entry already exists for {username}")]
    EntryExists {
        /// Username of the existing entry.
        username: String,
    },

    /// No entry for the username.
    #[error("no keywheel entry for {username}")]
    UnknownUser {
        /// Username that was looked up.
        username: String,
    },

    /// The requested round is behind the stored base and has been erased.
    #[error("round {requested} for {username} already erased (base is {base_round})")]
    RoundPassed {
        /// Username of the entry.
        username: String,
        /// Stored base round.
        base_round: u32,
        /// Round that was requested.
        requested: u32,
    },

    /// The persisted blob uses an unsupported format version.
    #[error("unsupported keywheel blob version {0}")]
    UnsupportedVersion(u8),

    /// The persisted blob is malformed.
    #[error("malformed keywheel blob: {reason}")]
    Malformed {
        /// What failed to parse.
        reason: String,
    },
}

struct WheelEntry {
    round: u32,
    secret: [u8; 32],
}

impl Drop for WheelEntry {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Map from friend username to ratchet state.
///
/// # Invariants
///
/// - At most one secret per friend at any time
/// - The base round never decreases
#[derive(Default)]
pub struct KeyWheel {
    entries: BTreeMap<String, WheelEntry>,
}

impl KeyWheel {
    /// Create an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh entry for `username`, valid from `base_round`.
    pub fn put(
        &mut self,
        username: &str,
        base_secret: [u8; 32],
        base_round: u32,
    ) -> Result<(), KeyWheelError> {
        if self.entries.contains_key(username) {
            return Err(KeyWheelError::EntryExists { username: username.to_string() });
        }
        self.entries
            .insert(username.to_string(), WheelEntry { round: base_round, secret: base_secret });
        Ok(())
    }

    /// Remove the entry for `username` entirely. No-op if absent.
    pub fn remove(&mut self, username: &str) {
        self.entries.remove(username);
    }

    /// Whether an entry exists for `username`.
    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    /// Base round of the entry for `username`, if present.
    pub fn base_round(&self, username: &str) -> Option<u32> {
        self.entries.get(username).map(|e| e.round)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the wheel has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Usernames with a live entry, in sorted order.
    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Derive the session key shared with `username` at `round`.
    ///
    /// Fast-forwards a copy of the stored base; the wheel itself does not
    /// advance (use [`erase`](Self::erase) for that).
    pub fn session_key(&self, username: &str, round: u32) -> Result<[u8; 32], KeyWheelError> {
        let entry = self
            .entries
            .get(username)
            .ok_or_else(|| KeyWheelError::UnknownUser { username: username.to_string() })?;

        if round < entry.round {
            return Err(KeyWheelError::RoundPassed {
                username: username.to_string(),
                base_round: entry.round,
                requested: round,
            });
        }

        let mut secret = entry.secret;
        for _ in entry.round..round {
            let next = step(&secret);
            secret.zeroize();
            secret = next;
        }

        let key = derive_session_key(&secret, round);
        secret.zeroize();
        Ok(key)
    }

    /// Advance the stored base for `username` to `before_round`, discarding
    /// all earlier secrets. Idempotent when `before_round <= base`; no-op for
    /// unknown users.
    pub fn erase(&mut self, username: &str, before_round: u32) {
        let Some(entry) = self.entries.get_mut(username) else {
            return;
        };
        while entry.round < before_round {
            let next = step(&entry.secret);
            entry.secret.zeroize();
            entry.secret = next;
            entry.round += 1;
        }
    }

    /// Serialize the wheel into its versioned binary blob.
    ///
    /// Layout: `version: u8`, `count: u32 BE`, then per entry (username
    /// order): `username_len: u16 BE`, username bytes, `round: u32 BE`,
    /// `secret: [u8; 32]`.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.entries.len() * 64);
        out.push(WHEEL_VERSION);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for (username, entry) in &self.entries {
            out.extend_from_slice(&(username.len() as u16).to_be_bytes());
            out.extend_from_slice(username.as_bytes());
            out.extend_from_slice(&entry.round.to_be_bytes());
            out.extend_from_slice(&entry.secret);
        }
        out
    }

    /// Parse a blob produced by [`marshal`](Self::marshal).
    pub fn unmarshal(data: &[u8]) -> Result<Self, KeyWheelError> {
        let mut r = Reader { data, pos: 0 };
        let version = r.u8()?;
        if version != WHEEL_VERSION {
            return Err(KeyWheelError::UnsupportedVersion(version));
        }

        let count = r.u32()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let name_len = r.u16()? as usize;
            let name_bytes = r.bytes(name_len)?;
            let username = std::str::from_utf8(name_bytes)
                .map_err(|_| KeyWheelError::Malformed { reason: "username not UTF-8".into() })?
                .to_string();
            let round = r.u32()?;
            let mut secret = [0u8; 32];
            secret.copy_from_slice(r.bytes(32)?);

            if entries.insert(username.clone(), WheelEntry { round, secret }).is_some() {
                return Err(KeyWheelError::Malformed {
                    reason: format!("duplicate entry for {username}"),
                });
            }
        }

        if r.pos != data.len() {
            return Err(KeyWheelError::Malformed { reason: "trailing bytes".into() });
        }

        Ok(Self { entries })
    }
}

/// One-way step to the next round's secret.
fn step(secret: &[u8; 32]) -> [u8; 32] {
    hmac_label(secret, STEP_LABEL, &[])
}

/// Derive the session key for `round` from that round's wheel secret.
fn derive_session_key(secret: &[u8; 32], round: u32) -> [u8; 32] {
    hmac_label(secret, SESSION_LABEL, &round.to_be_bytes())
}

fn hmac_label(secret: &[u8; 32], label: &[u8], extra: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    mac.update(extra);
    let digest = mac.finalize().into_bytes();

    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], KeyWheelError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| KeyWheelError::Malformed { reason: "truncated".into() })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, KeyWheelError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, KeyWheelError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, KeyWheelError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret() -> [u8; 32] {
        let mut secret = [0u8; 32];
        for (i, byte) in secret.iter_mut().enumerate() {
            *byte = i as u8;
        }
        secret
    }

    #[test]
    fn put_then_session_key() {
        let mut wheel = KeyWheel::new();
        wheel.put("alice@example.org", test_secret(), 10).unwrap();

        let key = wheel.session_key("alice@example.org", 10).unwrap();
        assert_eq!(key.len(), SESSION_KEY_LEN);
    }

    #[test]
    fn put_duplicate_fails() {
        let mut wheel = KeyWheel::new();
        wheel.put("alice@example.org", test_secret(), 0).unwrap();

        let result = wheel.put("alice@example.org", test_secret(), 5);
        assert!(matches!(result, Err(KeyWheelError::EntryExists { .. })));
    }

    #[test]
    fn session_key_unknown_user_fails() {
        let wheel = KeyWheel::new();
        let result = wheel.session_key("nobody@example.org", 0);
        assert!(matches!(result, Err(KeyWheelError::UnknownUser { .. })));
    }

    #[test]
    fn session_key_is_deterministic() {
        let mut a = KeyWheel::new();
        let mut b = KeyWheel::new();
        a.put("bob@example.org", test_secret(), 3).unwrap();
        b.put("bob@example.org", test_secret(), 3).unwrap();

        for round in 3..20 {
            assert_eq!(
                a.session_key("bob@example.org", round).unwrap(),
                b.session_key("bob@example.org", round).unwrap(),
                "same base must yield same key at round {round}"
            );
        }
    }

    #[test]
    fn rounds_yield_distinct_keys() {
        let mut wheel = KeyWheel::new();
        wheel.put("bob@example.org", test_secret(), 0).unwrap();

        let k5 = wheel.session_key("bob@example.org", 5).unwrap();
        let k6 = wheel.session_key("bob@example.org", 6).unwrap();
        assert_ne!(k5, k6);
    }

    #[test]
    fn erase_then_earlier_round_fails() {
        let mut wheel = KeyWheel::new();
        wheel.put("bob@example.org", test_secret(), 0).unwrap();

        let k7 = wheel.session_key("bob@example.org", 7).unwrap();

        wheel.erase("bob@example.org", 6);
        assert_eq!(wheel.base_round("bob@example.org"), Some(6));

        let result = wheel.session_key("bob@example.org", 5);
        assert!(matches!(result, Err(KeyWheelError::RoundPassed { base_round: 6, .. })));

        // Keys at and after the new base are unaffected.
        assert_eq!(wheel.session_key("bob@example.org", 7).unwrap(), k7);
    }

    #[test]
    fn erase_is_idempotent() {
        let mut wheel = KeyWheel::new();
        wheel.put("bob@example.org", test_secret(), 0).unwrap();

        wheel.erase("bob@example.org", 4);
        let k = wheel.session_key("bob@example.org", 4).unwrap();

        wheel.erase("bob@example.org", 4);
        wheel.erase("bob@example.org", 2);
        assert_eq!(wheel.base_round("bob@example.org"), Some(4));
        assert_eq!(wheel.session_key("bob@example.org", 4).unwrap(), k);
    }

    #[test]
    fn erase_unknown_user_is_noop() {
        let mut wheel = KeyWheel::new();
        wheel.erase("nobody@example.org", 100);
        assert!(wheel.is_empty());
    }

    #[test]
    fn erase_preserves_later_keys() {
        let mut wheel = KeyWheel::new();
        wheel.put("bob@example.org", test_secret(), 0).unwrap();

        let before: Vec<_> =
            (10..15).map(|r| wheel.session_key("bob@example.org", r).unwrap()).collect();

        wheel.erase("bob@example.org", 10);

        let after: Vec<_> =
            (10..15).map(|r| wheel.session_key("bob@example.org", r).unwrap()).collect();
        assert_eq!(before, after, "erase must not change surviving session keys");
    }

    #[test]
    fn marshal_roundtrip_is_byte_equal() {
        let mut wheel = KeyWheel::new();
        wheel.put("alice@example.org", test_secret(), 12).unwrap();
        wheel.put("bob@example.org", [0xAB; 32], 7).unwrap();

        let blob = wheel.marshal();
        let restored = KeyWheel::unmarshal(&blob).unwrap();
        assert_eq!(restored.marshal(), blob);
    }

    #[test]
    fn unmarshal_restores_session_keys() {
        let mut wheel = KeyWheel::new();
        wheel.put("alice@example.org", test_secret(), 2).unwrap();

        let restored = KeyWheel::unmarshal(&wheel.marshal()).unwrap();
        assert_eq!(
            restored.session_key("alice@example.org", 9).unwrap(),
            wheel.session_key("alice@example.org", 9).unwrap()
        );
    }

    #[test]
    fn unmarshal_rejects_bad_version() {
        let mut blob = KeyWheel::new().marshal();
        blob[0] = 9;
        assert!(matches!(KeyWheel::unmarshal(&blob), Err(KeyWheelError::UnsupportedVersion(9))));
    }

    #[test]
    fn unmarshal_rejects_trailing_bytes() {
        let mut blob = KeyWheel::new().marshal();
        blob.push(0);
        assert!(matches!(KeyWheel::unmarshal(&blob), Err(KeyWheelError::Malformed { .. })));
    }

    #[test]
    fn unmarshal_rejects_truncation() {
        let mut wheel = KeyWheel::new();
        wheel.put("alice@example.org", test_secret(), 0).unwrap();
        let blob = wheel.marshal();
        assert!(matches!(
            KeyWheel::unmarshal(&blob[..blob.len() - 5]),
            Err(KeyWheelError::Malformed { .. })
        ));
    }

    #[test]
    fn empty_wheel_roundtrip() {
        let blob = KeyWheel::new().marshal();
        let restored = KeyWheel::unmarshal(&blob).unwrap();
        assert!(restored.is_empty());
    }
}
