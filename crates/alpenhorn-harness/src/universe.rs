//! Wiring for a complete mock universe.
//!
//! A [`Universe`] owns a guardian key, a PKG committee, a two-service
//! coordinator, a mixchain, and a CDN, and hands out [`Client`]s that are
//! bootstrapped and registered against all of them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alpenhorn_client::{
    network::{CoordinatorConnector, MailboxFetcher, Network, PkgConnector, RoundSession},
    Client, ClientError, EventHandler, Identity,
};
use alpenhorn_proto::{
    CdnServerConfig, ConfigError, ConfigHash, ExtractRequest, ExtractResponse, Guardian,
    MixServerConfig, PkgServerConfig, RegisterRequest, RegisterResponse, ServiceConfig, ServiceId,
    SignedConfig,
};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::{
    cdn::MockCdn,
    coordinator::{MockCoordinator, RoundTiming},
    pkg::MockPkg,
};

/// A self-contained Alpenhorn deployment in one process.
pub struct Universe {
    coordinator: Arc<MockCoordinator>,
    pkgs: Arc<Mutex<Vec<Arc<MockPkg>>>>,
    cdn: Arc<MockCdn>,
    guardian: SigningKey,
    dir: TempDir,
    tasks: Vec<JoinHandle<()>>,
}

impl Universe {
    /// Launch a universe with three PKGs and default round timing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start() -> Self {
        Self::start_with_timing(RoundTiming::default())
    }

    /// Launch with custom round timing.
    pub fn start_with_timing(timing: RoundTiming) -> Self {
        let guardian = SigningKey::generate(&mut OsRng);
        let cdn = Arc::new(MockCdn::new());
        let pkgs: Vec<Arc<MockPkg>> = (1..=3).map(|i| Arc::new(MockPkg::launch(i))).collect();
        let committee: Vec<PkgServerConfig> = pkgs.iter().map(|p| p.config().clone()).collect();
        let pkgs = Arc::new(Mutex::new(pkgs));

        let addfriend_config = base_config(ServiceId::AddFriend, &guardian, committee, timing);
        let dialing_config = base_config(ServiceId::Dialing, &guardian, Vec::new(), timing);

        let (coordinator, tasks) = MockCoordinator::start(
            addfriend_config,
            dialing_config,
            pkgs.clone(),
            cdn.clone(),
            timing,
        );

        Self {
            coordinator: Arc::new(coordinator),
            pkgs,
            cdn,
            guardian,
            dir: TempDir::new().expect("create universe temp dir"),
            tasks,
        }
    }

    /// A [`Network`] bundle talking to this universe.
    pub fn network(&self) -> Network {
        let bridge = Arc::new(UniverseNetwork {
            coordinator: self.coordinator.clone(),
            pkgs: self.pkgs.clone(),
            cdn: self.cdn.clone(),
        });
        Network { coordinator: bridge.clone(), pkg: bridge.clone(), cdn: bridge }
    }

    /// Create a fresh client: bootstrapped with the current configs and
    /// registered with every PKG in the committee.
    pub async fn new_user(&self, username: &str, handler: Arc<dyn EventHandler>) -> Client {
        let client = Client::new(Identity::generate(username), self.network(), handler);
        client
            .bootstrap(
                self.coordinator.current_config(ServiceId::AddFriend),
                self.coordinator.current_config(ServiceId::Dialing),
            )
            .expect("bootstrap new user");

        let committee: Vec<PkgServerConfig> =
            self.pkgs.lock().iter().map(|p| p.config().clone()).collect();
        for pkg in &committee {
            client.register(pkg, None).await.expect("register new user at pkg");
        }
        client
    }

    /// Directory for client persist files.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Persist paths for a named client.
    pub fn client_paths(&self, name: &str) -> (PathBuf, PathBuf) {
        (self.dir.path().join(format!("{name}-client")), self.dir.path().join(format!("{name}-keywheel")))
    }

    /// The CDN, for tests that manipulate mailboxes directly.
    pub fn cdn(&self) -> Arc<MockCdn> {
        self.cdn.clone()
    }

    /// The current add-friend committee.
    pub fn addfriend_committee(&self) -> Vec<PkgServerConfig> {
        self.coordinator.current_config(ServiceId::AddFriend).inner.pkg_servers
    }

    /// Launch an additional PKG. It serves rounds once a config pinning it
    /// is published; clients must register with it themselves.
    pub fn launch_pkg(&self) -> PkgServerConfig {
        let mut pkgs = self.pkgs.lock();
        let pkg = Arc::new(MockPkg::launch(pkgs.len() as u32 + 1));
        let config = pkg.config().clone();
        pkgs.push(pkg);
        config
    }

    /// Publish a successor add-friend config that appends `new_pkg` to the
    /// committee.
    pub fn extend_addfriend_committee(&self, new_pkg: PkgServerConfig) -> Result<(), ConfigError> {
        let head = self.coordinator.current_config(ServiceId::AddFriend);
        let mut next = head.clone();
        next.signatures = BTreeMap::new();
        next.prev_config_hash = head.hash();
        next.created = Utc::now().max(head.created + TimeDelta::seconds(1));
        next.expires = next.created + TimeDelta::hours(24);
        next.inner.pkg_servers.push(new_pkg);
        next.sign_by("guardian", &self.guardian);
        self.coordinator.publish_config(ServiceId::AddFriend, next)
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn base_config(
    service: ServiceId,
    guardian: &SigningKey,
    pkg_servers: Vec<PkgServerConfig>,
    timing: RoundTiming,
) -> SignedConfig {
    let mix_servers = (0..timing.mix_hops)
        .map(|i| MixServerConfig {
            address: format!("mix{i}.example.org:2719"),
            key: SigningKey::generate(&mut OsRng).verifying_key(),
        })
        .collect();

    let mut config = SignedConfig {
        version: 1,
        service,
        created: Utc::now(),
        expires: Utc::now() + TimeDelta::hours(24),
        prev_config_hash: ConfigHash::zero(),
        guardians: vec![Guardian { username: "guardian".into(), key: guardian.verifying_key() }],
        inner: ServiceConfig {
            pkg_servers,
            mix_servers,
            cdn_server: CdnServerConfig {
                address: "cdn.example.org:8080".into(),
                key: SigningKey::generate(&mut OsRng).verifying_key(),
            },
        },
        signatures: BTreeMap::new(),
    };
    config.sign_by("guardian", guardian);
    config
}

/// Bridges the client's network traits onto the mock services.
struct UniverseNetwork {
    coordinator: Arc<MockCoordinator>,
    pkgs: Arc<Mutex<Vec<Arc<MockPkg>>>>,
    cdn: Arc<MockCdn>,
}

impl UniverseNetwork {
    fn pkg_by_key(&self, pinned: &PkgServerConfig) -> Result<Arc<MockPkg>, ClientError> {
        let pkgs = self.pkgs.lock();
        pkgs.iter()
            .find(|p| p.config().key == pinned.key)
            .cloned()
            .ok_or_else(|| ClientError::Network(format!("no PKG at {}", pinned.address)))
    }
}

#[async_trait]
impl CoordinatorConnector for UniverseNetwork {
    async fn open_session(&self, service: ServiceId) -> Result<RoundSession, ClientError> {
        let (incoming, outgoing) = self.coordinator.open_session(service);
        Ok(RoundSession { incoming, outgoing })
    }

    async fn fetch_config_chain(
        &self,
        service: ServiceId,
        have: ConfigHash,
    ) -> Result<Vec<SignedConfig>, ClientError> {
        Ok(self.coordinator.config_chain_from(service, have))
    }
}

#[async_trait]
impl PkgConnector for UniverseNetwork {
    async fn register(
        &self,
        pkg: &PkgServerConfig,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, ClientError> {
        let pkg = self.pkg_by_key(pkg)?;
        pkg.register(&request).map_err(Into::into)
    }

    async fn extract(
        &self,
        pkg: &PkgServerConfig,
        request: ExtractRequest,
    ) -> Result<ExtractResponse, ClientError> {
        let pkg = self.pkg_by_key(pkg)?;
        pkg.extract(&request).map_err(Into::into)
    }
}

#[async_trait]
impl MailboxFetcher for UniverseNetwork {
    async fn fetch(
        &self,
        service: ServiceId,
        round: u32,
        mailbox: u32,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        Ok(self.cdn.get(service, round, mailbox))
    }
}
