//! Network seams for the out-of-scope collaborators.
//!
//! The coordinator, PKG servers, and CDN are external services reached over
//! pinned-key TLS in production. The client core talks to them through these
//! traits; the harness provides in-process implementations backed by
//! channels, so protocol logic is testable without sockets.

use alpenhorn_proto::{
    ClientMessage, ConfigHash, CoordinatorMessage, ExtractRequest, ExtractResponse,
    PkgServerConfig, RegisterRequest, RegisterResponse, ServiceId, SignedConfig,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// A live round session for one service.
///
/// Dropping the session ends it; the coordinator side observes the channel
/// closing.
pub struct RoundSession {
    /// Round announcements and mailbox-ready signals from the coordinator.
    pub incoming: mpsc::Receiver<CoordinatorMessage>,
    /// Onion submissions to the coordinator.
    pub outgoing: mpsc::Sender<ClientMessage>,
}

/// Connection to the coordinator.
#[async_trait]
pub trait CoordinatorConnector: Send + Sync {
    /// Open a long-lived round session for `service`.
    async fn open_session(&self, service: ServiceId) -> Result<RoundSession, ClientError>;

    /// Fetch the config chain for `service` starting after the config with
    /// hash `have`, oldest first. The chain may include the `have` config
    /// itself.
    async fn fetch_config_chain(
        &self,
        service: ServiceId,
        have: ConfigHash,
    ) -> Result<Vec<SignedConfig>, ClientError>;
}

/// Request/response channel to a single PKG.
#[async_trait]
pub trait PkgConnector: Send + Sync {
    /// Register a login key with the PKG at `pkg`.
    async fn register(
        &self,
        pkg: &PkgServerConfig,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, ClientError>;

    /// Extract this round's identity-key share from the PKG at `pkg`.
    async fn extract(
        &self,
        pkg: &PkgServerConfig,
        request: ExtractRequest,
    ) -> Result<ExtractResponse, ClientError>;
}

/// Mailbox retrieval from the CDN.
#[async_trait]
pub trait MailboxFetcher: Send + Sync {
    /// Fetch one round mailbox. `None` when the mailbox is empty or the
    /// round is unknown.
    async fn fetch(
        &self,
        service: ServiceId,
        round: u32,
        mailbox: u32,
    ) -> Result<Option<Vec<u8>>, ClientError>;
}

/// The bundle of external services a client talks to.
#[derive(Clone)]
pub struct Network {
    /// Coordinator connection.
    pub coordinator: Arc<dyn CoordinatorConnector>,
    /// PKG request channel.
    pub pkg: Arc<dyn PkgConnector>,
    /// Mailbox CDN.
    pub cdn: Arc<dyn MailboxFetcher>,
}
