//! Dial tokens and friend key agreement.
//!
//! A dial token announces a call to one friend in one dialing round. It is
//! sealed under the keywheel session key for that round, so reception is by
//! trial decryption: only the intended friend holds a key that opens it.
//! The nonce is derived from the round; a session key is used for at most
//! one token, making the deterministic nonce safe.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Wire size of a sealed dial token: one intent byte plus the Poly1305 tag.
pub const DIAL_TOKEN_LEN: usize = 1 + 16;

/// HKDF info for the keywheel base secret of a new friendship.
const FRIEND_SEED_INFO: &[u8] = b"alpenhorn-keywheel-base";

/// Nonce prefix binding tokens to the dialing service.
const TOKEN_NONCE_PREFIX: &[u8] = b"dial-token";

/// Seal `intent` for `callee` under the shared `session_key` at `round`.
///
/// The session key is symmetric, so the callee's identity is bound into the
/// nonce: the caller's own copy of the token does not open on the caller's
/// side of the trial decryption.
pub fn seal_dial_token(session_key: &[u8; 32], round: u32, callee: &str, intent: u8) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(session_key.into());
    let nonce = token_nonce(round, callee);
    let Ok(sealed) = cipher.encrypt(XNonce::from_slice(&nonce), [intent].as_slice()) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    sealed
}

/// Trial-open a dial token addressed to `callee` with one friend's round
/// session key.
///
/// Returns the intent on success, `None` when the token was sealed for a
/// different friend, callee, or round.
pub fn open_dial_token(
    session_key: &[u8; 32],
    round: u32,
    callee: &str,
    token: &[u8],
) -> Option<u8> {
    if token.len() != DIAL_TOKEN_LEN {
        return None;
    }
    let cipher = XChaCha20Poly1305::new(session_key.into());
    let nonce = token_nonce(round, callee);
    let plaintext = cipher.decrypt(XNonce::from_slice(&nonce), token).ok()?;
    match plaintext.as_slice() {
        [intent] => Some(*intent),
        _ => None,
    }
}

/// Derive the keywheel base secret both sides of a new friendship share.
///
/// Symmetric in the two parties: the DH output is identical on both sides and
/// the salt orders the two public keys bytewise, not by role.
pub fn friend_seed(
    our_secret: &StaticSecret,
    our_public: &PublicKey,
    their_public: &PublicKey,
) -> [u8; 32] {
    let shared = our_secret.diffie_hellman(their_public);

    let (lo, hi) = if our_public.as_bytes() <= their_public.as_bytes() {
        (our_public, their_public)
    } else {
        (their_public, our_public)
    };
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(lo.as_bytes());
    salt.extend_from_slice(hi.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut seed = [0u8; 32];
    let Ok(()) = hkdf.expand(FRIEND_SEED_INFO, &mut seed) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    seed
}

fn token_nonce(round: u32, callee: &str) -> [u8; 24] {
    let callee_digest = Sha256::digest(callee.as_bytes());
    let mut nonce = [0u8; 24];
    nonce[..TOKEN_NONCE_PREFIX.len()].copy_from_slice(TOKEN_NONCE_PREFIX);
    nonce[TOKEN_NONCE_PREFIX.len()..TOKEN_NONCE_PREFIX.len() + 4]
        .copy_from_slice(&round.to_be_bytes());
    nonce[TOKEN_NONCE_PREFIX.len() + 4..].copy_from_slice(
        &callee_digest[..24 - TOKEN_NONCE_PREFIX.len() - 4],
    );
    nonce
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    const BOB: &str = "bob@example.org";

    #[test]
    fn token_roundtrip() {
        let key = [0x42u8; 32];
        let token = seal_dial_token(&key, 17, BOB, 3);
        assert_eq!(token.len(), DIAL_TOKEN_LEN);
        assert_eq!(open_dial_token(&key, 17, BOB, &token), Some(3));
    }

    #[test]
    fn wrong_key_fails() {
        let token = seal_dial_token(&[0x42u8; 32], 17, BOB, 3);
        assert_eq!(open_dial_token(&[0x43u8; 32], 17, BOB, &token), None);
    }

    #[test]
    fn wrong_round_fails() {
        let key = [0x42u8; 32];
        let token = seal_dial_token(&key, 17, BOB, 3);
        assert_eq!(open_dial_token(&key, 18, BOB, &token), None);
    }

    #[test]
    fn caller_cannot_open_own_token() {
        // Both sides hold the same session key; only the callee binding
        // distinguishes them.
        let key = [0x42u8; 32];
        let token = seal_dial_token(&key, 17, BOB, 3);
        assert_eq!(open_dial_token(&key, 17, "alice@example.org", &token), None);
    }

    #[test]
    fn wrong_length_fails() {
        let key = [0x42u8; 32];
        assert_eq!(open_dial_token(&key, 0, BOB, &[0u8; DIAL_TOKEN_LEN + 1]), None);
        assert_eq!(open_dial_token(&key, 0, BOB, &[]), None);
    }

    #[test]
    fn intent_range_preserved() {
        let key = [0x01u8; 32];
        for intent in [0u8, 1, 127, 255] {
            let token = seal_dial_token(&key, 5, BOB, intent);
            assert_eq!(open_dial_token(&key, 5, BOB, &token), Some(intent));
        }
    }

    #[test]
    fn friend_seed_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(11);
        let a_secret = StaticSecret::random_from_rng(&mut rng);
        let a_public = PublicKey::from(&a_secret);
        let b_secret = StaticSecret::random_from_rng(&mut rng);
        let b_public = PublicKey::from(&b_secret);

        let a_seed = friend_seed(&a_secret, &a_public, &b_public);
        let b_seed = friend_seed(&b_secret, &b_public, &a_public);
        assert_eq!(a_seed, b_seed);
    }

    #[test]
    fn different_pairs_derive_different_seeds() {
        let mut rng = StdRng::seed_from_u64(12);
        let a_secret = StaticSecret::random_from_rng(&mut rng);
        let a_public = PublicKey::from(&a_secret);
        let b_public = PublicKey::from(&StaticSecret::random_from_rng(&mut rng));
        let c_public = PublicKey::from(&StaticSecret::random_from_rng(&mut rng));

        let ab = friend_seed(&a_secret, &a_public, &b_public);
        let ac = friend_seed(&a_secret, &a_public, &c_public);
        assert_ne!(ab, ac);
    }
}
