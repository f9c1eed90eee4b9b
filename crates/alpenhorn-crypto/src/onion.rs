//! Layered sealing for mix-net submission.
//!
//! Each mix hop peels one layer: an ephemeral X25519 public key, an XChaCha20
//! nonce, and an AEAD ciphertext of the next layer. Payloads are padded to a
//! uniform size before sealing so every onion in a batch is
//! indistinguishable.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::{CryptoRng, Rng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// HKDF info for per-layer key derivation.
const LAYER_KEY_INFO: &[u8] = b"alpenhorn-onion";

/// XChaCha20 nonce length.
const NONCE_LEN: usize = 24;

/// Poly1305 tag length.
const TAG_LEN: usize = 16;

/// Bytes added by one onion layer.
const LAYER_OVERHEAD: usize = 32 + NONCE_LEN + TAG_LEN;

/// Errors from peeling or unpadding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OnionError {
    /// The layer is too short to contain a header.
    #[error("onion layer truncated")]
    Truncated,

    /// AEAD authentication failed: wrong hop secret or tampering.
    #[error("onion layer failed to open")]
    BadLayer,

    /// The padded payload's length prefix is inconsistent.
    #[error("invalid payload padding")]
    BadPadding,
}

/// Total onion size for a padded payload routed through `hops` layers.
pub fn onion_len(padded_payload_len: usize, hops: usize) -> usize {
    padded_payload_len + hops * LAYER_OVERHEAD
}

/// Pad `payload` to `padded_len` with a length prefix.
///
/// Panics if the payload (plus its 4-byte prefix) exceeds `padded_len`;
/// batch payload sizes are fixed constants chosen by the engines.
pub fn pad_payload(payload: &[u8], padded_len: usize) -> Vec<u8> {
    assert!(payload.len() + 4 <= padded_len, "payload exceeds padded size");
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(padded_len, 0);
    out
}

/// Strip the padding applied by [`pad_payload`].
pub fn unpad_payload(padded: &[u8]) -> Result<Vec<u8>, OnionError> {
    if padded.len() < 4 {
        return Err(OnionError::BadPadding);
    }
    let len = u32::from_be_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(OnionError::BadPadding);
    }
    Ok(padded[4..4 + len].to_vec())
}

/// Seal `payload` for delivery through `hops`, first hop outermost.
pub fn seal_onion<R: Rng + CryptoRng>(
    payload: &[u8],
    hops: &[PublicKey],
    rng: &mut R,
) -> Vec<u8> {
    let mut inner = payload.to_vec();
    for hop in hops.iter().rev() {
        inner = seal_layer(&inner, hop, rng);
    }
    inner
}

/// Peel one layer with the hop's onion secret.
pub fn peel_onion(onion: &[u8], hop_secret: &StaticSecret) -> Result<Vec<u8>, OnionError> {
    if onion.len() < LAYER_OVERHEAD {
        return Err(OnionError::Truncated);
    }

    let mut eph_bytes = [0u8; 32];
    eph_bytes.copy_from_slice(&onion[..32]);
    let eph_public = PublicKey::from(eph_bytes);
    let nonce = &onion[32..32 + NONCE_LEN];
    let sealed = &onion[32 + NONCE_LEN..];

    let shared = hop_secret.diffie_hellman(&eph_public);
    let key = layer_key(shared.as_bytes(), &eph_public, &PublicKey::from(hop_secret));

    let cipher = XChaCha20Poly1305::new(&key.into());
    cipher.decrypt(XNonce::from_slice(nonce), sealed).map_err(|_| OnionError::BadLayer)
}

fn seal_layer<R: Rng + CryptoRng>(inner: &[u8], hop: &PublicKey, rng: &mut R) -> Vec<u8> {
    let eph_secret = EphemeralSecret::random_from_rng(&mut *rng);
    let eph_public = PublicKey::from(&eph_secret);
    let shared = eph_secret.diffie_hellman(hop);
    let key = layer_key(shared.as_bytes(), &eph_public, hop);

    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(&key.into());
    let Ok(sealed) = cipher.encrypt(XNonce::from_slice(&nonce), inner) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut out = Vec::with_capacity(32 + NONCE_LEN + sealed.len());
    out.extend_from_slice(eph_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    out
}

fn layer_key(shared: &[u8; 32], eph_public: &PublicKey, hop: &PublicKey) -> [u8; 32] {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(eph_public.as_bytes());
    salt.extend_from_slice(hop.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(LAYER_KEY_INFO, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}
