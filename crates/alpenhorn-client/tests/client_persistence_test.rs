//! Persistence behavior of the client blobs.
//!
//! Covers the persist/load round-trip law (a second marshal is byte-equal),
//! atomic-write permissions, the empty-path in-memory mode, and the
//! closed-client api surface. Network traits are stubbed out; nothing here
//! opens a session.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use alpenhorn_client::{
    network::{CoordinatorConnector, MailboxFetcher, Network, PkgConnector, RoundSession},
    Client, ClientError, EventHandler, Identity,
};
use alpenhorn_proto::{
    CdnServerConfig, ConfigHash, ExtractRequest, ExtractResponse, Guardian, PkgServerConfig,
    RegisterRequest, RegisterResponse, ServiceConfig, ServiceId, SignedConfig,
};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

/// Network stub for tests that never touch the wire.
struct OfflineNetwork;

#[async_trait]
impl CoordinatorConnector for OfflineNetwork {
    async fn open_session(&self, _service: ServiceId) -> Result<RoundSession, ClientError> {
        Err(ClientError::Network("offline".into()))
    }

    async fn fetch_config_chain(
        &self,
        _service: ServiceId,
        _have: ConfigHash,
    ) -> Result<Vec<SignedConfig>, ClientError> {
        Err(ClientError::Network("offline".into()))
    }
}

#[async_trait]
impl PkgConnector for OfflineNetwork {
    async fn register(
        &self,
        _pkg: &PkgServerConfig,
        _request: RegisterRequest,
    ) -> Result<RegisterResponse, ClientError> {
        Err(ClientError::Network("offline".into()))
    }

    async fn extract(
        &self,
        _pkg: &PkgServerConfig,
        _request: ExtractRequest,
    ) -> Result<ExtractResponse, ClientError> {
        Err(ClientError::Network("offline".into()))
    }
}

#[async_trait]
impl MailboxFetcher for OfflineNetwork {
    async fn fetch(
        &self,
        _service: ServiceId,
        _round: u32,
        _mailbox: u32,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        Ok(None)
    }
}

struct NullHandler;

impl EventHandler for NullHandler {
    fn error(&self, _err: ClientError) {}
    fn confirmed_friend(&self, _friend: alpenhorn_client::Friend) {}
    fn sent_friend_request(&self, _request: alpenhorn_client::OutgoingFriendRequest) {}
    fn received_friend_request(&self, _request: alpenhorn_client::IncomingFriendRequest) {}
    fn sent_call(&self, _call: alpenhorn_client::OutgoingCall) {}
    fn received_call(&self, _call: alpenhorn_client::IncomingCall) {}
    fn unexpected_signing_key(
        &self,
        _incoming: alpenhorn_client::IncomingFriendRequest,
        _outgoing: alpenhorn_client::OutgoingFriendRequest,
    ) {
    }
}

fn offline_network() -> Network {
    let stub = Arc::new(OfflineNetwork);
    Network { coordinator: stub.clone(), pkg: stub.clone(), cdn: stub }
}

fn test_config(service: ServiceId, guardian_key: &SigningKey) -> SignedConfig {
    let mut config = SignedConfig {
        version: 1,
        service,
        created: Utc::now(),
        expires: Utc::now() + TimeDelta::hours(24),
        prev_config_hash: ConfigHash::zero(),
        guardians: vec![Guardian {
            username: "guardian".into(),
            key: guardian_key.verifying_key(),
        }],
        inner: ServiceConfig {
            pkg_servers: vec![],
            mix_servers: vec![],
            cdn_server: CdnServerConfig {
                address: "cdn.example.org:8080".into(),
                key: SigningKey::generate(&mut OsRng).verifying_key(),
            },
        },
        signatures: BTreeMap::new(),
    };
    config.sign_by("guardian", guardian_key);
    config
}

fn bootstrapped_client(dir: &std::path::Path) -> Client {
    let guardian = SigningKey::generate(&mut OsRng);
    let client = Client::new(
        Identity::generate("alice@example.org"),
        offline_network(),
        Arc::new(NullHandler),
    );
    client.set_client_persist_path(dir.join("alice-client"));
    client.set_keywheel_persist_path(dir.join("alice-keywheel"));
    client
        .bootstrap(
            test_config(ServiceId::AddFriend, &guardian),
            test_config(ServiceId::Dialing, &guardian),
        )
        .unwrap();
    client
}

#[test]
fn persist_then_load_then_persist_is_byte_equal() {
    let dir = tempfile::tempdir().unwrap();
    let client = bootstrapped_client(dir.path());

    client.send_friend_request("bob@example.org", None).unwrap();
    client.send_friend_request("carol@example.org", None).unwrap();

    let first_blob = fs::read(dir.path().join("alice-client")).unwrap();
    let first_wheel = fs::read(dir.path().join("alice-keywheel")).unwrap();
    client.close().unwrap();

    let reloaded = Client::load(
        dir.path().join("alice-client"),
        dir.path().join("alice-keywheel"),
        offline_network(),
        Arc::new(NullHandler),
    )
    .unwrap();

    assert_eq!(reloaded.username(), "alice@example.org");
    let outgoing = reloaded.outgoing_friend_requests();
    assert_eq!(outgoing.len(), 2);
    assert_eq!(outgoing[0].username, "bob@example.org");
    assert_eq!(outgoing[1].username, "carol@example.org");

    reloaded.persist().unwrap();
    assert_eq!(fs::read(dir.path().join("alice-client")).unwrap(), first_blob);
    assert_eq!(fs::read(dir.path().join("alice-keywheel")).unwrap(), first_wheel);
}

#[test]
fn load_preserves_long_term_identity() {
    let dir = tempfile::tempdir().unwrap();
    let client = bootstrapped_client(dir.path());
    let public = client.long_term_public();
    client.close().unwrap();

    let reloaded = Client::load(
        dir.path().join("alice-client"),
        dir.path().join("alice-keywheel"),
        offline_network(),
        Arc::new(NullHandler),
    )
    .unwrap();
    assert_eq!(reloaded.long_term_public(), public);
}

#[cfg(unix)]
#[test]
fn blobs_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let _client = bootstrapped_client(dir.path());

    for name in ["alice-client", "alice-keywheel"] {
        let mode = fs::metadata(dir.path().join(name)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600, "{name} must be mode 0600");
    }
}

#[test]
fn unset_paths_mean_in_memory() {
    let guardian = SigningKey::generate(&mut OsRng);
    let client = Client::new(
        Identity::generate("ephemeral@example.org"),
        offline_network(),
        Arc::new(NullHandler),
    );
    client
        .bootstrap(
            test_config(ServiceId::AddFriend, &guardian),
            test_config(ServiceId::Dialing, &guardian),
        )
        .unwrap();

    // No paths configured: every persist is a successful no-op.
    client.persist().unwrap();
    client.send_friend_request("bob@example.org", None).unwrap();
}

#[test]
fn tampered_config_fails_load() {
    let dir = tempfile::tempdir().unwrap();
    let client = bootstrapped_client(dir.path());
    client.close().unwrap();

    let path = dir.path().join("alice-client");
    let mut blob: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    blob["AddFriendConfig"]["Version"] = serde_json::json!(99);
    fs::write(&path, serde_json::to_vec_pretty(&blob).unwrap()).unwrap();

    let result = Client::load(
        &path,
        dir.path().join("alice-keywheel"),
        offline_network(),
        Arc::new(NullHandler),
    );
    assert!(matches!(
        result,
        Err(ClientError::Persist(alpenhorn_client::PersistError::ConfigIntegrity(_)))
    ));
}

#[test]
fn closed_client_rejects_operations() {
    let dir = tempfile::tempdir().unwrap();
    let client = bootstrapped_client(dir.path());

    client.close().unwrap();
    client.close().unwrap();

    assert!(matches!(client.persist(), Err(ClientError::Closed)));
    assert!(matches!(
        client.send_friend_request("bob@example.org", None),
        Err(ClientError::Closed)
    ));
    assert!(matches!(client.connect(), Err(ClientError::Closed)));
}

#[test]
fn self_friend_request_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client = bootstrapped_client(dir.path());
    assert!(matches!(
        client.send_friend_request("alice@example.org", None),
        Err(ClientError::Protocol(_))
    ));
}
