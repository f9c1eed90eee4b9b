//! A mock mix chain.
//!
//! Generates fresh per-round onion keys, peels submitted onions layer by
//! layer, and shuffles the results so mailbox placement carries no
//! submission order.

use alpenhorn_crypto::{peel_onion, unpad_payload};
use rand::{rngs::OsRng, seq::SliceRandom};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

/// A chain of mix hops.
pub struct MockMixchain {
    hops: usize,
}

impl MockMixchain {
    /// Create a chain with `hops` servers.
    pub fn new(hops: usize) -> Self {
        Self { hops }
    }

    /// Generate this round's hop secrets and the publics to announce.
    pub fn round_keys(&self) -> (Vec<StaticSecret>, Vec<[u8; 32]>) {
        let secrets: Vec<StaticSecret> =
            (0..self.hops).map(|_| StaticSecret::random_from_rng(OsRng)).collect();
        let publics = secrets.iter().map(|s| PublicKey::from(s).to_bytes()).collect();
        (secrets, publics)
    }

    /// Peel every onion through all hops and return shuffled
    /// `(mailbox, envelope)` pairs. Malformed onions are dropped.
    pub fn mix(&self, secrets: &[StaticSecret], onions: &[Vec<u8>]) -> Vec<(u32, Vec<u8>)> {
        let mut output = Vec::with_capacity(onions.len());

        'onion: for onion in onions {
            let mut layer = onion.clone();
            for secret in secrets {
                match peel_onion(&layer, secret) {
                    Ok(inner) => layer = inner,
                    Err(err) => {
                        debug!(%err, "dropping onion that failed to peel");
                        continue 'onion;
                    },
                }
            }

            let Ok(payload) = unpad_payload(&layer) else {
                debug!("dropping onion with bad padding");
                continue;
            };
            if payload.len() < 4 {
                debug!("dropping onion with short payload");
                continue;
            }
            let mailbox = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            output.push((mailbox, payload[4..].to_vec()));
        }

        output.shuffle(&mut OsRng);
        output
    }
}
