//! Registration and per-round committee key extraction.
//!
//! Extraction is all-or-nothing: every PKG in the committee must answer with
//! a verifiable share before the shares are Lagrange-combined, and the
//! combined key is pairing-checked against the round master public key. Any
//! failure aborts the round locally; queued requests are untouched.

use alpenhorn_crypto::{
    combine_master_public, combine_private_key, verify_extraction, IdentityPrivateKey,
    MasterPublicKey, MasterPublicShare, PrivateKeyShare,
};
use alpenhorn_proto::{
    extract_signing_message, ExtractRequest, PkgServerConfig, RegisterRequest, ServiceId,
    SignedPkgSettings,
};
use ed25519_dalek::{Signer, Verifier};
use tokio::task::JoinSet;
use tracing::debug;

use crate::{client::Identity, error::ClientError, network::Network};

/// The combined round key material for one add-friend round.
pub(crate) struct CommitteeKeys {
    /// Combined round master public key; encrypt friend requests under it.
    pub master_public: MasterPublicKey,
    /// Our combined round identity key; trial-decrypt mailboxes with it.
    pub ibe_key: IdentityPrivateKey,
}

/// Register the login key with one PKG.
pub(crate) async fn register(
    network: &Network,
    identity: &Identity,
    pkg: &PkgServerConfig,
    token: Option<String>,
) -> Result<(), ClientError> {
    let request = RegisterRequest {
        username: identity.username.clone(),
        login_key: identity.pkg_login.verifying_key(),
        token,
    };
    let response = network.pkg.register(pkg, request).await?;
    if response.username != identity.username {
        return Err(ClientError::Protocol(format!(
            "pkg {} acknowledged registration for wrong user {}",
            pkg.address, response.username
        )));
    }
    Ok(())
}

/// Verify the announced per-round PKG settings and combine the master key.
pub(crate) fn combine_round_master(
    service: ServiceId,
    round: u32,
    committee: &[PkgServerConfig],
    settings: &[SignedPkgSettings],
) -> Result<MasterPublicKey, ClientError> {
    if settings.len() != committee.len() {
        return Err(ClientError::Protocol(format!(
            "round {round} announced {} PKG settings for a committee of {}",
            settings.len(),
            committee.len()
        )));
    }

    let mut shares = Vec::with_capacity(settings.len());
    for (position, (pkg, setting)) in committee.iter().zip(settings).enumerate() {
        let expected_index = position as u32 + 1;
        if setting.index != expected_index {
            return Err(ClientError::Protocol(format!(
                "round {round} PKG settings out of committee order: got index {}, want {}",
                setting.index, expected_index
            )));
        }
        if !setting.verify(service, round, &pkg.key) {
            return Err(ClientError::Protocol(format!(
                "round {round} settings signature from pkg {} is invalid",
                pkg.address
            )));
        }
        shares.push(
            MasterPublicShare::from_bytes(setting.index, &setting.master_share)
                .map_err(|e| ClientError::Crypto(e.to_string()))?,
        );
    }

    combine_master_public(&shares).map_err(|e| ClientError::Crypto(e.to_string()))
}

/// Extract our round identity key from every PKG in the committee.
pub(crate) async fn extract_committee(
    network: &Network,
    identity: &Identity,
    service: ServiceId,
    round: u32,
    committee: &[PkgServerConfig],
    settings: &[SignedPkgSettings],
) -> Result<CommitteeKeys, ClientError> {
    let master_public = combine_round_master(service, round, committee, settings)?;

    let challenge = extract_signing_message(service, round, &identity.username);
    let signature = identity.pkg_login.sign(&challenge);

    let mut extractions = JoinSet::new();
    for (position, pkg) in committee.iter().enumerate() {
        let connector = network.pkg.clone();
        let pkg = pkg.clone();
        let announced_share = settings[position].master_share.clone();
        let request = ExtractRequest {
            round,
            username: identity.username.clone(),
            signature,
        };
        let expected_index = position as u32 + 1;

        extractions.spawn(async move {
            let response = connector.extract(&pkg, request).await?;

            if response.round != round || response.index != expected_index {
                return Err(ClientError::Protocol(format!(
                    "pkg {} answered for round {} index {}, want round {round} index \
                     {expected_index}",
                    pkg.address, response.round, response.index
                )));
            }
            if pkg.key.verify(&response.signing_message(), &response.signature).is_err() {
                return Err(ClientError::Protocol(format!(
                    "pkg {} extract response signature is invalid",
                    pkg.address
                )));
            }
            if response.master_share != announced_share {
                return Err(ClientError::Protocol(format!(
                    "pkg {} extract response disagrees with announced round settings",
                    pkg.address
                )));
            }

            PrivateKeyShare::from_bytes(expected_index, &response.key_share)
                .map_err(|e| ClientError::Crypto(e.to_string()))
        });
    }

    let mut shares = Vec::with_capacity(committee.len());
    while let Some(joined) = extractions.join_next().await {
        let share = joined.map_err(|e| ClientError::Network(format!("extract task: {e}")))??;
        shares.push(share);
    }
    shares.sort_by_key(|s| s.index);

    let ibe_key = combine_private_key(&shares).map_err(|e| ClientError::Crypto(e.to_string()))?;
    if !verify_extraction(&master_public, &identity.username, &ibe_key) {
        return Err(ClientError::Crypto(format!(
            "combined identity key for round {round} failed the pairing check"
        )));
    }

    debug!(round, committee = committee.len(), "extracted round identity key");
    Ok(CommitteeKeys { master_public, ibe_key })
}
