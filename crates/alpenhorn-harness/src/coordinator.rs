//! A mock coordinator: one round scheduler per service.
//!
//! Each service task announces rounds on a fixed cadence, collects onion
//! batches until the submission window closes, runs them through the
//! mixchain, publishes the result to the CDN, and signals mailbox
//! availability. Config updates published through
//! [`MockCoordinator::publish_config`] take effect at the next announcement,
//! exactly like the newconfig endpoint the test harness uses against a real
//! coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alpenhorn_proto::{
    ClientMessage, ConfigError, ConfigHash, CoordinatorMessage, RoundAnnouncement, ServiceId,
    SignedConfig,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{cdn::MockCdn, mixchain::MockMixchain, pkg::MockPkg};

/// Round cadence and sizing for a mock universe.
#[derive(Debug, Clone, Copy)]
pub struct RoundTiming {
    /// Pause between rounds.
    pub round_wait: Duration,
    /// Submission window per round.
    pub mix_wait: Duration,
    /// CDN mailboxes per round.
    pub num_mailboxes: u32,
    /// Mix hops per service.
    pub mix_hops: usize,
}

impl Default for RoundTiming {
    fn default() -> Self {
        Self {
            round_wait: Duration::from_millis(250),
            mix_wait: Duration::from_millis(500),
            num_mailboxes: 1,
            mix_hops: 3,
        }
    }
}

/// The coordinator's half of one client session.
pub(crate) struct CoordSession {
    tx: mpsc::Sender<CoordinatorMessage>,
    rx: mpsc::Receiver<ClientMessage>,
}

struct ServiceHandle {
    register_tx: mpsc::UnboundedSender<CoordSession>,
    chain: Arc<Mutex<Vec<SignedConfig>>>,
}

/// A two-service mock coordinator.
pub struct MockCoordinator {
    services: HashMap<ServiceId, ServiceHandle>,
}

impl MockCoordinator {
    /// Start round schedulers for both services.
    pub fn start(
        addfriend_config: SignedConfig,
        dialing_config: SignedConfig,
        pkgs: Arc<Mutex<Vec<Arc<MockPkg>>>>,
        cdn: Arc<MockCdn>,
        timing: RoundTiming,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut services = HashMap::new();
        let mut tasks = Vec::new();

        for (service, config) in
            [(ServiceId::AddFriend, addfriend_config), (ServiceId::Dialing, dialing_config)]
        {
            let (register_tx, register_rx) = mpsc::unbounded_channel();
            let chain = Arc::new(Mutex::new(vec![config]));
            tasks.push(tokio::spawn(run_service(
                service,
                timing,
                register_rx,
                chain.clone(),
                pkgs.clone(),
                cdn.clone(),
            )));
            services.insert(service, ServiceHandle { register_tx, chain });
        }

        (Self { services }, tasks)
    }

    /// The current config head for `service`.
    pub fn current_config(&self, service: ServiceId) -> SignedConfig {
        let chain = self.services[&service].chain.lock();
        chain.last().cloned().expect("chain always holds the bootstrap config")
    }

    /// Accept a new signed config, as the newconfig endpoint would.
    pub fn publish_config(
        &self,
        service: ServiceId,
        config: SignedConfig,
    ) -> Result<(), ConfigError> {
        let mut chain = self.services[&service].chain.lock();
        let head = chain.last().expect("chain always holds the bootstrap config");
        head.verify_next(&config)?;
        chain.push(config);
        Ok(())
    }

    /// The chain suffix a client holding `have` needs to catch up.
    pub fn config_chain_from(&self, service: ServiceId, have: ConfigHash) -> Vec<SignedConfig> {
        let chain = self.services[&service].chain.lock();
        match chain.iter().position(|c| c.hash() == have) {
            Some(pos) => chain[pos + 1..].to_vec(),
            None => chain.clone(),
        }
    }

    /// Open a client session: announcements flow out, onion batches flow in.
    pub(crate) fn open_session(
        &self,
        service: ServiceId,
    ) -> (mpsc::Receiver<CoordinatorMessage>, mpsc::Sender<ClientMessage>) {
        let (announce_tx, announce_rx) = mpsc::channel(16);
        let (submit_tx, submit_rx) = mpsc::channel(16);
        let session = CoordSession { tx: announce_tx, rx: submit_rx };
        let _ = self.services[&service].register_tx.send(session);
        (announce_rx, submit_tx)
    }
}

async fn run_service(
    service: ServiceId,
    timing: RoundTiming,
    mut register_rx: mpsc::UnboundedReceiver<CoordSession>,
    chain: Arc<Mutex<Vec<SignedConfig>>>,
    pkgs: Arc<Mutex<Vec<Arc<MockPkg>>>>,
    cdn: Arc<MockCdn>,
) {
    let mixchain = MockMixchain::new(timing.mix_hops);
    let mut sessions: Vec<CoordSession> = Vec::new();
    let mut round = 0u32;

    loop {
        tokio::time::sleep(timing.round_wait).await;
        while let Ok(session) = register_rx.try_recv() {
            sessions.push(session);
        }
        sessions.retain(|s| !s.tx.is_closed());

        round += 1;
        let config = {
            let chain = chain.lock();
            chain.last().cloned().expect("chain always holds the bootstrap config")
        };

        let pkg_settings = if service == ServiceId::AddFriend {
            let pkgs = pkgs.lock();
            let mut settings = Vec::new();
            let mut missing = false;
            for pinned in &config.inner.pkg_servers {
                match pkgs.iter().find(|p| p.config().key == pinned.key) {
                    Some(pkg) => settings.push(pkg.round_settings(service, round)),
                    None => {
                        warn!(%service, round, address = %pinned.address, "no mock for pinned PKG");
                        missing = true;
                    },
                }
            }
            if missing {
                continue;
            }
            settings
        } else {
            Vec::new()
        };

        let (secrets, onion_keys) = mixchain.round_keys();
        let announcement = RoundAnnouncement {
            service,
            round,
            config_hash: config.hash(),
            onion_keys,
            pkg_settings,
            num_mailboxes: timing.num_mailboxes,
            submit_window_ms: timing.mix_wait.as_millis() as u64,
        };
        for session in &sessions {
            let _ = session.tx.try_send(CoordinatorMessage::NewRound(announcement.clone()));
        }

        // Collect submissions until the window closes.
        let deadline = tokio::time::Instant::now() + timing.mix_wait;
        let mut onions = Vec::new();
        while tokio::time::Instant::now() < deadline {
            for session in &mut sessions {
                while let Ok(message) = session.rx.try_recv() {
                    let ClientMessage::Onions { round: submitted_round, onions: batch } = message;
                    if submitted_round == round {
                        onions.extend(batch);
                    } else {
                        debug!(%service, round, submitted_round, "dropping late batch");
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for (mailbox, envelope) in mixchain.mix(&secrets, &onions) {
            cdn.put(service, round, mailbox, &envelope);
        }
        for session in &sessions {
            let _ = session.tx.try_send(CoordinatorMessage::MailboxReady { round });
        }
    }
}
