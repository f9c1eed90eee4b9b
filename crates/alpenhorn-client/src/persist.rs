//! Durable client state: the JSON client blob and the binary keywheel blob.
//!
//! The two blobs are always written together under the client lock so their
//! file mtimes cannot drift apart and leak which mutation just happened.
//! Writes are atomic: same-directory temp file, fsync, rename, mode 0600.
//! An unset path turns the corresponding write into a no-op success, which
//! is how in-memory clients are built.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use alpenhorn_crypto::KeyWheel;
use alpenhorn_proto::{wire, ConfigError, ServiceId, SignedConfig};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    client::Identity,
    error::PersistError,
    state::{ClientState, FriendRecord, IncomingRecord, OutgoingRecord, SentRecord},
};

/// The client blob as written to disk.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PersistedState {
    username: String,
    #[serde(with = "wire::b64_array")]
    long_term_public_key: [u8; 32],
    #[serde(with = "wire::b64")]
    long_term_private_key: Vec<u8>,
    #[serde(rename = "PKGLoginKey", with = "wire::b64")]
    pkg_login_key: Vec<u8>,

    add_friend_config: SignedConfig,
    dialing_config: SignedConfig,

    incoming_friend_requests: Vec<IncomingRecord>,
    outgoing_friend_requests: Vec<OutgoingRecord>,
    sent_friend_requests: Vec<SentRecord>,
    friends: BTreeMap<String, FriendRecord>,
}

/// Write both blobs. The keywheel write is attempted even when the client
/// blob write failed; the first error wins.
pub(crate) fn persist_locked(identity: &Identity, state: &ClientState) -> Result<(), PersistError> {
    let client_result = persist_client_locked(identity, state);
    let wheel_result = persist_keywheel_locked(state);
    client_result.and(wheel_result)
}

/// Write the client blob, or succeed without touching disk when no path is
/// configured.
fn persist_client_locked(identity: &Identity, state: &ClientState) -> Result<(), PersistError> {
    let Some(path) = &state.client_persist_path else {
        return Ok(());
    };

    let (Some(addfriend), Some(dialing)) = (&state.addfriend, &state.dialing) else {
        return Err(PersistError::NotBootstrapped);
    };

    let blob = PersistedState {
        username: identity.username.clone(),
        long_term_public_key: identity.long_term.verifying_key().to_bytes(),
        long_term_private_key: identity.long_term.to_keypair_bytes().to_vec(),
        pkg_login_key: identity.pkg_login.to_keypair_bytes().to_vec(),
        add_friend_config: addfriend.config.clone(),
        dialing_config: dialing.config.clone(),
        incoming_friend_requests: state.incoming.clone(),
        outgoing_friend_requests: state.outgoing.clone(),
        sent_friend_requests: state.sent.clone(),
        friends: state.friends.clone(),
    };

    let json = serde_json::to_vec_pretty(&blob)?;
    write_file_atomic(path, &json)
}

/// Write the keywheel blob, or succeed without touching disk when no path is
/// configured.
fn persist_keywheel_locked(state: &ClientState) -> Result<(), PersistError> {
    let Some(path) = &state.keywheel_persist_path else {
        return Ok(());
    };
    write_file_atomic(path, &state.wheel.marshal())
}

/// Everything restored from the two blobs.
pub(crate) struct LoadedClient {
    pub identity: Identity,
    pub state: ClientState,
}

/// Restore a client from its two persisted blobs.
///
/// Both stored configs are re-verified against their guardian sets; a blob
/// whose configs no longer verify is rejected rather than trusted.
pub(crate) fn load(client_path: &Path, keywheel_path: &Path) -> Result<LoadedClient, PersistError> {
    let blob: PersistedState = serde_json::from_slice(&fs::read(client_path)?)?;

    let long_term = signing_key(&blob.long_term_private_key, "LongTermPrivateKey")?;
    if long_term.verifying_key().to_bytes() != blob.long_term_public_key {
        return Err(PersistError::BadKey(
            "LongTermPublicKey does not match LongTermPrivateKey".into(),
        ));
    }
    let pkg_login = signing_key(&blob.pkg_login_key, "PKGLoginKey")?;

    verify_stored_config(&blob.add_friend_config, ServiceId::AddFriend)?;
    verify_stored_config(&blob.dialing_config, ServiceId::Dialing)?;

    let wheel = KeyWheel::unmarshal(&fs::read(keywheel_path)?)?;
    for friend in blob.friends.keys() {
        if !wheel.contains(friend) {
            return Err(PersistError::BadKey(format!("friend {friend} has no keywheel entry")));
        }
    }

    let mut state = ClientState::new();
    state.client_persist_path = Some(client_path.to_path_buf());
    state.keywheel_persist_path = Some(keywheel_path.to_path_buf());
    state.set_config(ServiceId::AddFriend, blob.add_friend_config);
    state.set_config(ServiceId::Dialing, blob.dialing_config);
    state.incoming = blob.incoming_friend_requests;
    state.outgoing = blob.outgoing_friend_requests;
    state.sent = blob.sent_friend_requests;
    state.friends = blob.friends;
    state.wheel = wheel;
    for record in &state.incoming {
        state.seen_envelopes.insert(record.envelope_digest);
    }

    let identity = Identity { username: blob.username, long_term, pkg_login };
    Ok(LoadedClient { identity, state })
}

fn signing_key(bytes: &[u8], field: &str) -> Result<SigningKey, PersistError> {
    let keypair: &[u8; 64] = bytes
        .try_into()
        .map_err(|_| PersistError::BadKey(format!("{field} is not 64 bytes")))?;
    SigningKey::from_keypair_bytes(keypair)
        .map_err(|e| PersistError::BadKey(format!("{field}: {e}")))
}

fn verify_stored_config(config: &SignedConfig, service: ServiceId) -> Result<(), PersistError> {
    if config.service != service {
        return Err(PersistError::ConfigIntegrity(ConfigError::ServiceMismatch {
            expected: service,
            actual: config.service,
        }));
    }
    config.verify_bootstrap().map_err(PersistError::ConfigIntegrity)
}

/// Temp-file-then-rename write with owner-only permissions.
fn write_file_atomic(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path).map_err(|e| PersistError::Io(e.error))?;
    Ok(())
}
