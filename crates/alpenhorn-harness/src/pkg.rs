//! A mock PKG server.
//!
//! Holds a registration table and a fresh master share per round. Extraction
//! enforces the same checks a real PKG would: the username must be
//! registered and the challenge must be signed by the registered login key.

use std::collections::HashMap;

use alpenhorn_crypto::MasterShare;
use alpenhorn_proto::{
    extract_signing_message, ExtractRequest, ExtractResponse, PkgError, PkgErrorCode,
    PkgServerConfig, RegisterRequest, RegisterResponse, ServiceId, SignedPkgSettings,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;

struct PkgState {
    registered: HashMap<String, VerifyingKey>,
    round_shares: HashMap<u32, MasterShare>,
}

/// One mock PKG, identified by its committee index and long-term key.
pub struct MockPkg {
    index: u32,
    signing: SigningKey,
    config: PkgServerConfig,
    state: Mutex<PkgState>,
}

impl MockPkg {
    /// Launch a PKG for 1-based committee position `index`.
    pub fn launch(index: u32) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let config = PkgServerConfig {
            address: format!("pkg{index}.example.org:2438"),
            key: signing.verifying_key(),
        };
        Self {
            index,
            signing,
            config,
            state: Mutex::new(PkgState {
                registered: HashMap::new(),
                round_shares: HashMap::new(),
            }),
        }
    }

    /// The config entry committees pin for this PKG.
    pub fn config(&self) -> &PkgServerConfig {
        &self.config
    }

    /// Handle a registration request.
    pub fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, PkgError> {
        if !request.username.contains('@') || request.username.is_empty() {
            return Err(PkgError::new(PkgErrorCode::InvalidUsername, &request.username));
        }

        let mut state = self.state.lock();
        if let Some(existing) = state.registered.get(&request.username) {
            if *existing != request.login_key {
                return Err(PkgError::new(PkgErrorCode::AlreadyRegistered, &request.username));
            }
            return Ok(RegisterResponse { username: request.username.clone() });
        }
        state.registered.insert(request.username.clone(), request.login_key);
        Ok(RegisterResponse { username: request.username.clone() })
    }

    /// Publish this PKG's signed round settings, generating the round master
    /// share on first use.
    pub fn round_settings(&self, service: ServiceId, round: u32) -> SignedPkgSettings {
        let mut state = self.state.lock();
        let share = state
            .round_shares
            .entry(round)
            .or_insert_with(|| MasterShare::generate(self.index, &mut OsRng));
        SignedPkgSettings::sign(
            service,
            round,
            self.index,
            share.public_share().to_bytes(),
            &self.signing,
        )
    }

    /// Handle an extract request for the add-friend service.
    pub fn extract(&self, request: &ExtractRequest) -> Result<ExtractResponse, PkgError> {
        let state = self.state.lock();

        let login_key = state
            .registered
            .get(&request.username)
            .ok_or_else(|| PkgError::new(PkgErrorCode::NotRegistered, &request.username))?;

        let challenge =
            extract_signing_message(ServiceId::AddFriend, request.round, &request.username);
        if login_key.verify(&challenge, &request.signature).is_err() {
            return Err(PkgError::new(
                PkgErrorCode::InvalidSignature,
                "extract challenge signature does not verify",
            ));
        }

        let share = state
            .round_shares
            .get(&request.round)
            .ok_or_else(|| PkgError::new(PkgErrorCode::RoundNotFound, request.round.to_string()))?;

        let mut response = ExtractResponse {
            round: request.round,
            username: request.username.clone(),
            index: self.index,
            key_share: share.extract(&request.username).to_bytes(),
            master_share: share.public_share().to_bytes(),
            signature: self.signing.sign(b""),
        };
        response.signature = self.signing.sign(&response.signing_message());
        Ok(response)
    }
}
