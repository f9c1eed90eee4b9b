//! The client: identity, public api, and the per-service round loops.
//!
//! All mutable state lives behind one lock; see the crate docs for the
//! locking discipline. The round loops are tokio tasks spawned by
//! [`Client::connect`] and cancelled by [`Client::close`] at their next
//! suspension point.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use alpenhorn_proto::{ConfigError, ConfigHash, CoordinatorMessage, PkgServerConfig, ServiceId, SignedConfig};
use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::OsRng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    addfriend::{self, AddFriendRound},
    dialing::{self, DialingRound},
    error::ClientError,
    handler::{dispatch, Event, EventHandler, Friend, IncomingFriendRequest, OutgoingFriendRequest},
    network::{Network, RoundSession},
    persist, pkg_client,
    state::{ClientState, ExpectedKey, OutgoingRecord, PendingCall},
};

/// Delay before reopening a dropped coordinator session.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// A user's long-term key material.
pub struct Identity {
    /// Address-like username.
    pub username: String,
    /// Long-term signing key, the user's public identity.
    pub long_term: SigningKey,
    /// Separate signing key used only to authenticate to PKGs.
    pub pkg_login: SigningKey,
}

impl Identity {
    /// Generate a fresh identity for `username`.
    pub fn generate(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            long_term: SigningKey::generate(&mut OsRng),
            pkg_login: SigningKey::generate(&mut OsRng),
        }
    }

    /// The public half of the long-term key.
    pub fn long_term_public(&self) -> VerifyingKey {
        self.long_term.verifying_key()
    }
}

pub(crate) struct ClientInner {
    pub identity: Identity,
    pub network: Network,
    pub handler: Arc<dyn EventHandler>,
    state: Mutex<ClientState>,
    closed: AtomicBool,
    connected: AtomicBool,
    pub close_notify: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    pub fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The Alpenhorn client. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Create a fresh, in-memory client. Call [`bootstrap`](Self::bootstrap)
    /// with the two service configs before connecting; set persist paths to
    /// make the client durable.
    pub fn new(identity: Identity, network: Network, handler: Arc<dyn EventHandler>) -> Self {
        Self::from_parts(identity, ClientState::new(), network, handler)
    }

    /// Restore a client from its persisted blobs.
    pub fn load(
        client_path: impl AsRef<Path>,
        keywheel_path: impl AsRef<Path>,
        network: Network,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, ClientError> {
        let loaded = persist::load(client_path.as_ref(), keywheel_path.as_ref())?;
        Ok(Self::from_parts(loaded.identity, loaded.state, network, handler))
    }

    fn from_parts(
        identity: Identity,
        state: ClientState,
        network: Network,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                identity,
                network,
                handler,
                state: Mutex::new(state),
                closed: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                close_notify: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This client's username.
    pub fn username(&self) -> &str {
        &self.inner.identity.username
    }

    /// The public half of this client's long-term key.
    pub fn long_term_public(&self) -> VerifyingKey {
        self.inner.identity.long_term.verifying_key()
    }

    /// Configure the client blob path. An unset path keeps the client
    /// in-memory.
    pub fn set_client_persist_path(&self, path: impl Into<PathBuf>) {
        self.inner.lock().client_persist_path = Some(path.into());
    }

    /// Configure the keywheel blob path. An unset path keeps the wheel
    /// in-memory.
    pub fn set_keywheel_persist_path(&self, path: impl Into<PathBuf>) {
        self.inner.lock().keywheel_persist_path = Some(path.into());
    }

    /// Install the initial config for both services.
    ///
    /// The configs must be obtained out of band; they anchor all later chain
    /// advancement.
    pub fn bootstrap(
        &self,
        addfriend: SignedConfig,
        dialing: SignedConfig,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        verify_bootstrap_config(&addfriend, ServiceId::AddFriend)?;
        verify_bootstrap_config(&dialing, ServiceId::Dialing)?;

        let mut st = self.inner.lock();
        st.set_config(ServiceId::AddFriend, addfriend);
        st.set_config(ServiceId::Dialing, dialing);
        persist::persist_locked(&self.inner.identity, &st)?;
        Ok(())
    }

    /// Write both state blobs now. The client persists itself on every
    /// mutation; this is only needed right after creating a new client.
    pub fn persist(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let st = self.inner.lock();
        persist::persist_locked(&self.inner.identity, &st)?;
        Ok(())
    }

    /// Register this client's login key with one PKG.
    pub async fn register(
        &self,
        pkg: &PkgServerConfig,
        token: Option<String>,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        pkg_client::register(&self.inner.network, &self.inner.identity, pkg, token).await
    }

    /// Start the two service round loops.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        {
            let st = self.inner.lock();
            if st.addfriend.is_none() || st.dialing.is_none() {
                return Err(ClientError::Protocol("client is not bootstrapped".into()));
            }
        }
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Protocol("client is already connected".into()));
        }

        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(run_service_loop(self.clone(), ServiceId::AddFriend)));
        tasks.push(tokio::spawn(run_service_loop(self.clone(), ServiceId::Dialing)));
        Ok(())
    }

    /// Queue a friend request for the next add-friend round.
    ///
    /// With `expected_key` set, a reply signed by any other key fires
    /// [`EventHandler::unexpected_signing_key`] instead of confirming.
    pub fn send_friend_request(
        &self,
        username: &str,
        expected_key: Option<VerifyingKey>,
    ) -> Result<OutgoingFriendRequest, ClientError> {
        self.ensure_open()?;
        if username == self.inner.identity.username {
            return Err(ClientError::Protocol("cannot send a friend request to yourself".into()));
        }

        let mut st = self.inner.lock();
        if st.addfriend.is_none() {
            return Err(ClientError::Protocol("client is not bootstrapped".into()));
        }

        let dh_private = StaticSecret::random_from_rng(OsRng);
        let dh_public = PublicKey::from(&dh_private).to_bytes();
        let dial_round = st.next_dial_round();

        st.outgoing.push(OutgoingRecord {
            username: username.to_string(),
            expected_key: expected_key.map(ExpectedKey),
            dh_public,
            dh_private,
            dial_round,
        });

        if let Err(err) = persist::persist_locked(&self.inner.identity, &st) {
            st.outgoing.pop();
            return Err(err.into());
        }

        Ok(OutgoingFriendRequest { username: username.to_string(), expected_key, dial_round })
    }

    /// Look up a confirmed friend.
    pub fn friend(&self, username: &str) -> Option<Friend> {
        let st = self.inner.lock();
        st.friends.get(username).map(|record| Friend {
            username: record.username.clone(),
            long_term_key: record.long_term_key,
            client: self.weak(),
        })
    }

    /// All confirmed friends.
    pub fn friends(&self) -> Vec<Friend> {
        let st = self.inner.lock();
        st.friends
            .values()
            .map(|record| Friend {
                username: record.username.clone(),
                long_term_key: record.long_term_key,
                client: self.weak(),
            })
            .collect()
    }

    /// Outgoing friend requests not yet submitted to a round.
    pub fn outgoing_friend_requests(&self) -> Vec<OutgoingFriendRequest> {
        let st = self.inner.lock();
        st.outgoing
            .iter()
            .map(|record| OutgoingFriendRequest {
                username: record.username.clone(),
                expected_key: record.expected_key.map(|k| k.0),
                dial_round: record.dial_round,
            })
            .collect()
    }

    /// Incoming friend requests awaiting a decision.
    pub fn incoming_friend_requests(&self) -> Vec<IncomingFriendRequest> {
        let st = self.inner.lock();
        st.incoming
            .iter()
            .map(|record| IncomingFriendRequest {
                username: record.username.clone(),
                long_term_key: record.long_term_key,
                dh_public: record.dh_public,
                dial_round: record.dial_round,
                round: record.round,
                verifiers: record.verifiers.clone(),
                client: self.weak(),
            })
            .collect()
    }

    /// Stop the round loops. Idempotent; afterwards every operation returns
    /// [`ClientError::Closed`]. Persisted state is untouched and a later
    /// [`Client::load`] restores it.
    pub fn close(&self) -> Result<(), ClientError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.close_notify.notify_waiters();
        let mut tasks = self.inner.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ClientError> {
        if self.inner.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn weak(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    /// Deliver buffered events, lock not held.
    pub(crate) fn dispatch(&self, events: Vec<Event>) {
        dispatch(self.inner.handler.as_ref(), events);
    }

    /// Get the config head for `service`, advancing the chain from the
    /// coordinator when the announced hash is ahead of ours.
    pub(crate) async fn ensure_config(
        &self,
        service: ServiceId,
        expected: ConfigHash,
    ) -> Result<SignedConfig, ClientError> {
        let (current, hash) = {
            let st = self.inner.lock();
            let cs = st
                .config(service)
                .ok_or_else(|| ClientError::Protocol("client is not bootstrapped".into()))?;
            (cs.config.clone(), cs.hash)
        };
        if hash == expected {
            return Ok(current);
        }

        let chain = self.inner.network.coordinator.fetch_config_chain(service, hash).await?;
        let new_head = current.advance_chain(&chain)?;
        if new_head.hash() != expected {
            // The coordinator is operating under a config it has not served
            // through newconfig. Abandon the round rather than guess.
            return Err(ClientError::Protocol(format!(
                "{service} round announced a config ahead of the published chain"
            )));
        }

        {
            let mut st = self.inner.lock();
            st.set_config(service, new_head.clone());
            persist::persist_locked(&self.inner.identity, &st)?;
        }
        debug!(%service, "advanced config chain");
        Ok(new_head)
    }
}

fn verify_bootstrap_config(config: &SignedConfig, service: ServiceId) -> Result<(), ClientError> {
    if config.service != service {
        return Err(ClientError::Config(ConfigError::ServiceMismatch {
            expected: service,
            actual: config.service,
        }));
    }
    config.verify_bootstrap()?;
    Ok(())
}

impl Friend {
    /// Announce a call with an application-opaque intent.
    ///
    /// The call goes out in the next dialing round the friendship's keywheel
    /// has reached; [`EventHandler::sent_call`] fires when it does.
    pub fn call(&self, intent: u8) -> Result<(), ClientError> {
        let inner = self.upgrade()?;
        let mut st = inner.lock();
        if !st.friends.contains_key(&self.username) {
            return Err(ClientError::Protocol(format!("{} is not a friend", self.username)));
        }
        st.pending_calls.push(PendingCall { username: self.username.clone(), intent });
        Ok(())
    }

    /// Opaque application bytes stored with this friend.
    pub fn extra_data(&self) -> Result<Vec<u8>, ClientError> {
        let inner = self.upgrade()?;
        let st = inner.lock();
        let record = st
            .friends
            .get(&self.username)
            .ok_or_else(|| ClientError::Protocol(format!("{} is not a friend", self.username)))?;
        Ok(record.extra_data.clone())
    }

    /// Replace the opaque application bytes stored with this friend.
    pub fn set_extra_data(&self, data: Vec<u8>) -> Result<(), ClientError> {
        let inner = self.upgrade()?;
        let mut st = inner.lock();
        let record = st
            .friends
            .get_mut(&self.username)
            .ok_or_else(|| ClientError::Protocol(format!("{} is not a friend", self.username)))?;
        let previous = std::mem::replace(&mut record.extra_data, data);
        if let Err(err) = persist::persist_locked(&inner.identity, &st) {
            if let Some(record) = st.friends.get_mut(&self.username) {
                record.extra_data = previous;
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Remove this friend and destroy the shared keywheel entry.
    pub fn remove(&self) -> Result<(), ClientError> {
        let inner = self.upgrade()?;
        let mut st = inner.lock();
        st.friends.remove(&self.username);
        st.wheel.remove(&self.username);
        st.pending_calls.retain(|call| call.username != self.username);
        persist::persist_locked(&inner.identity, &st)?;
        Ok(())
    }

    fn upgrade(&self) -> Result<Arc<ClientInner>, ClientError> {
        let inner = self.client.upgrade().ok_or(ClientError::Closed)?;
        if inner.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(inner)
    }
}

impl IncomingFriendRequest {
    /// Accept this request: queue an outgoing request pinned to the
    /// sender's long-term key. Confirmation follows in the next add-friend
    /// round.
    pub fn approve(&self) -> Result<OutgoingFriendRequest, ClientError> {
        let inner = self.client.upgrade().ok_or(ClientError::Closed)?;
        if inner.is_closed() {
            return Err(ClientError::Closed);
        }

        let mut st = inner.lock();
        let dh_private = StaticSecret::random_from_rng(OsRng);
        let dh_public = PublicKey::from(&dh_private).to_bytes();
        let dial_round = st.next_dial_round();

        st.outgoing.push(OutgoingRecord {
            username: self.username.clone(),
            expected_key: Some(ExpectedKey(self.long_term_key)),
            dh_public,
            dh_private,
            dial_round,
        });

        if let Err(err) = persist::persist_locked(&inner.identity, &st) {
            st.outgoing.pop();
            return Err(err.into());
        }

        Ok(OutgoingFriendRequest {
            username: self.username.clone(),
            expected_key: Some(self.long_term_key),
            dial_round,
        })
    }

    /// Discard this request without answering it.
    pub fn remove(&self) -> Result<(), ClientError> {
        let inner = self.client.upgrade().ok_or(ClientError::Closed)?;
        if inner.is_closed() {
            return Err(ClientError::Closed);
        }

        let mut st = inner.lock();
        st.incoming.retain(|record| {
            record.username != self.username || record.dh_public != self.dh_public
        });
        persist::persist_locked(&inner.identity, &st)?;
        Ok(())
    }
}

/// One service's lifetime: open a session, run it, reconnect on loss.
async fn run_service_loop(client: Client, service: ServiceId) {
    loop {
        if client.inner.is_closed() {
            return;
        }

        let session = tokio::select! {
            _ = client.inner.close_notify.notified() => return,
            session = client.inner.network.coordinator.open_session(service) => session,
        };

        match session {
            Ok(session) => {
                if run_session(&client, service, session).await.is_break() {
                    return;
                }
                debug!(%service, "round session ended; reconnecting");
            },
            Err(err) => client.inner.handler.error(err),
        }

        tokio::select! {
            _ = client.inner.close_notify.notified() => return,
            () = tokio::time::sleep(RECONNECT_DELAY) => {},
        }
    }
}

/// Process one session's announcements strictly in round order.
async fn run_session(
    client: &Client,
    service: ServiceId,
    mut session: RoundSession,
) -> ControlFlow<()> {
    let mut pending_addfriend: Option<AddFriendRound> = None;
    let mut pending_dialing: Option<DialingRound> = None;

    loop {
        let message = tokio::select! {
            _ = client.inner.close_notify.notified() => return ControlFlow::Break(()),
            message = session.incoming.recv() => message,
        };
        let Some(message) = message else {
            return ControlFlow::Continue(());
        };

        match message {
            CoordinatorMessage::NewRound(ann) => {
                if ann.service != service {
                    client.inner.handler.error(ClientError::Protocol(format!(
                        "{service} session announced a {} round",
                        ann.service
                    )));
                    continue;
                }
                {
                    let mut st = client.inner.lock();
                    let last = st.last_round.get(&service).copied().unwrap_or(0);
                    if last != 0 && ann.round <= last {
                        debug!(%service, round = ann.round, last, "skipping stale round");
                        continue;
                    }
                    st.last_round.insert(service, ann.round);
                }

                match service {
                    ServiceId::AddFriend => {
                        pending_addfriend =
                            match addfriend::handle_announcement(client, &session.outgoing, &ann)
                                .await
                            {
                                Ok(round) => Some(round),
                                Err(err) => {
                                    client.inner.handler.error(err);
                                    None
                                },
                            };
                    },
                    ServiceId::Dialing => {
                        pending_dialing =
                            match dialing::handle_announcement(client, &session.outgoing, &ann)
                                .await
                            {
                                Ok(round) => Some(round),
                                Err(err) => {
                                    client.inner.handler.error(err);
                                    None
                                },
                            };
                    },
                }
            },

            CoordinatorMessage::MailboxReady { round } => match service {
                ServiceId::AddFriend => {
                    if let Some(pending) = pending_addfriend.take() {
                        if pending.round == round {
                            if let Err(err) = addfriend::handle_mailbox(client, &pending).await {
                                client.inner.handler.error(err);
                            }
                        } else {
                            warn!(%service, round, pending = pending.round, "mailbox for wrong round");
                            pending_addfriend = Some(pending);
                        }
                    }
                },
                ServiceId::Dialing => {
                    if let Some(pending) = pending_dialing.take() {
                        if pending.round == round {
                            if let Err(err) = dialing::handle_mailbox(client, &pending).await {
                                client.inner.handler.error(err);
                            }
                        } else {
                            warn!(%service, round, pending = pending.round, "mailbox for wrong round");
                            pending_dialing = Some(pending);
                        }
                    }
                },
            },
        }
    }
}
