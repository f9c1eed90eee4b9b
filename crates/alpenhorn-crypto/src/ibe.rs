//! Identity-based encryption with a threshold PKG committee.
//!
//! Boneh-Franklin-style IBE over BN254. Each PKG in a committee holds a
//! scalar master share; the round master public key and a user's round
//! private key are reconstructed from all shares by Lagrange interpolation
//! at zero, so a single missing or dishonest PKG makes extraction fail
//! rather than degrade.
//!
//! Decryption is trial-based: a ciphertext that was not addressed to the
//! holder's identity simply fails to open. Mailbox scanning relies on this
//! being silent.

use ark_bn254::{Bn254, Fq, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{
    pairing::{Pairing, PairingOutput},
    AffineRepr, CurveGroup, VariableBaseMSM,
};
use ark_ff::{Field, PrimeField};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::UniformRand;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::{CryptoRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain separator for hashing identities into G1.
const H1_DOMAIN: &[u8] = b"alpenhorn-ibe-h1";

/// HKDF info for deriving the envelope key from the pairing output.
const ENVELOPE_KEY_INFO: &[u8] = b"alpenhorn-ibe-envelope";

/// XChaCha20 nonce length.
const NONCE_LEN: usize = 24;

/// Errors from share combination and wire decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IbeError {
    /// No shares were provided.
    #[error("empty committee")]
    EmptyCommittee,

    /// Two shares carry the same committee index.
    #[error("duplicate committee index {0}")]
    DuplicateIndex(u32),

    /// A share carries index zero, which is reserved for the combined secret.
    #[error("committee index zero is invalid")]
    ZeroIndex,

    /// A serialized group element failed to decode.
    #[error("malformed group element: {0}")]
    Malformed(String),
}

/// A PKG's scalar master share for one round.
pub struct MasterShare {
    index: u32,
    scalar: Fr,
}

impl MasterShare {
    /// Generate a fresh random share for the PKG at 1-based `index`.
    pub fn generate<R: Rng + CryptoRng>(index: u32, rng: &mut R) -> Self {
        Self { index, scalar: Fr::rand(rng) }
    }

    /// Committee position of this share.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The public half of this share.
    pub fn public_share(&self) -> MasterPublicShare {
        MasterPublicShare {
            index: self.index,
            point: (G2Affine::generator() * self.scalar).into_affine(),
        }
    }

    /// Extract the private-key share for `identity`.
    pub fn extract(&self, identity: &str) -> PrivateKeyShare {
        PrivateKeyShare {
            index: self.index,
            point: (hash_to_g1(identity.as_bytes()) * self.scalar).into_affine(),
        }
    }
}

/// The public half of a PKG's master share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterPublicShare {
    /// 1-based committee position.
    pub index: u32,
    point: G2Affine,
}

impl MasterPublicShare {
    /// Compressed encoding of the share point.
    pub fn to_bytes(&self) -> Vec<u8> {
        ser_compressed(&self.point)
    }

    /// Decode a share received from a PKG at the given committee position.
    pub fn from_bytes(index: u32, bytes: &[u8]) -> Result<Self, IbeError> {
        Ok(Self { index, point: de_compressed::<G2Affine>(bytes)? })
    }
}

/// One PKG's share of a user's round private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateKeyShare {
    /// 1-based committee position.
    pub index: u32,
    point: G1Affine,
}

impl PrivateKeyShare {
    /// Compressed encoding of the share point.
    pub fn to_bytes(&self) -> Vec<u8> {
        ser_compressed(&self.point)
    }

    /// Decode a share received from a PKG at the given committee position.
    pub fn from_bytes(index: u32, bytes: &[u8]) -> Result<Self, IbeError> {
        Ok(Self { index, point: de_compressed::<G1Affine>(bytes)? })
    }
}

/// The combined round master public key of a committee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterPublicKey(G2Affine);

/// A user's combined round private key.
#[derive(Clone)]
pub struct IdentityPrivateKey(G1Affine);

/// An envelope encrypted to an identity under a round master key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IbeCiphertext {
    u: G2Affine,
    sealed: Vec<u8>,
}

impl IbeCiphertext {
    /// Wire encoding: compressed `U` followed by nonce and ciphertext.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = ser_compressed(&self.u);
        out.extend_from_slice(&self.sealed);
        out
    }

    /// Parse a wire-encoded envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IbeError> {
        let mut reader = bytes;
        let u = G2Affine::deserialize_compressed(&mut reader)
            .map_err(|e| IbeError::Malformed(e.to_string()))?;
        if reader.len() < NONCE_LEN {
            return Err(IbeError::Malformed("sealed part truncated".into()));
        }
        Ok(Self { u, sealed: reader.to_vec() })
    }
}

/// Combine per-PKG public shares into the round master public key.
pub fn combine_master_public(shares: &[MasterPublicShare]) -> Result<MasterPublicKey, IbeError> {
    let coeffs = lagrange_at_zero(&indices(shares.iter().map(|s| s.index))?)?;
    let points: Vec<G2Affine> = shares.iter().map(|s| s.point).collect();
    Ok(MasterPublicKey(G2Projective::msm_unchecked(&points, &coeffs).into_affine()))
}

/// Combine per-PKG private-key shares into the user's round private key.
pub fn combine_private_key(shares: &[PrivateKeyShare]) -> Result<IdentityPrivateKey, IbeError> {
    let coeffs = lagrange_at_zero(&indices(shares.iter().map(|s| s.index))?)?;
    let points: Vec<G1Affine> = shares.iter().map(|s| s.point).collect();
    Ok(IdentityPrivateKey(G1Projective::msm_unchecked(&points, &coeffs).into_affine()))
}

/// Check that a combined private key matches `identity` under `master`.
///
/// Pairing identity: e(d, g2) == e(H1(id), mpk).
pub fn verify_extraction(
    master: &MasterPublicKey,
    identity: &str,
    key: &IdentityPrivateKey,
) -> bool {
    Bn254::pairing(key.0, G2Affine::generator())
        == Bn254::pairing(hash_to_g1(identity.as_bytes()), master.0)
}

/// Encrypt `plaintext` to `identity` under the round master public key.
pub fn encrypt<R: Rng + CryptoRng>(
    master: &MasterPublicKey,
    identity: &str,
    plaintext: &[u8],
    rng: &mut R,
) -> IbeCiphertext {
    let r = Fr::rand(rng);
    let u = (G2Affine::generator() * r).into_affine();

    let gid = Bn254::pairing(hash_to_g1(identity.as_bytes()), master.0) * r;
    let key = envelope_key(&gid);

    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(&key.into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    IbeCiphertext { u, sealed }
}

/// Trial-decrypt an envelope with the holder's round private key.
///
/// Returns `None` when the envelope was not addressed to this identity or
/// was tampered with; the failure is indistinguishable by design.
pub fn decrypt(key: &IdentityPrivateKey, ciphertext: &IbeCiphertext) -> Option<Vec<u8>> {
    let gid = Bn254::pairing(key.0, ciphertext.u);
    let envelope_key = envelope_key(&gid);

    let (nonce, sealed) = ciphertext.sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(&envelope_key.into());
    cipher.decrypt(XNonce::from_slice(nonce), sealed).ok()
}

/// Hash an identity onto G1 by try-and-increment.
///
/// BN254's G1 has cofactor one, so any on-curve point is in the prime-order
/// subgroup.
fn hash_to_g1(identity: &[u8]) -> G1Affine {
    for counter in 0u32.. {
        let mut hasher = Sha256::new();
        hasher.update(H1_DOMAIN);
        hasher.update(counter.to_be_bytes());
        hasher.update(identity);
        let digest = hasher.finalize();

        let x = Fq::from_le_bytes_mod_order(&digest);
        let greatest = digest[0] & 1 == 1;
        if let Some(point) = G1Affine::get_point_from_x_unchecked(x, greatest) {
            return point;
        }
    }
    unreachable!("try-and-increment terminates for roughly half of all x candidates")
}

/// Derive the symmetric envelope key from a pairing output.
fn envelope_key(gid: &PairingOutput<Bn254>) -> [u8; 32] {
    let mut ikm = Vec::new();
    let Ok(()) = gid.serialize_compressed(&mut ikm) else {
        unreachable!("serialization into a Vec cannot fail");
    };

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(ENVELOPE_KEY_INFO, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}

/// Lagrange coefficients at zero for the given 1-based evaluation points.
fn lagrange_at_zero(indices: &[u32]) -> Result<Vec<Fr>, IbeError> {
    let mut coeffs = Vec::with_capacity(indices.len());
    for &i in indices {
        let mut num = Fr::from(1u64);
        let mut den = Fr::from(1u64);
        let xi = Fr::from(i);
        for &j in indices {
            if i != j {
                let xj = Fr::from(j);
                num *= xj;
                den *= xj - xi;
            }
        }
        let inv = den.inverse().ok_or(IbeError::DuplicateIndex(i))?;
        coeffs.push(num * inv);
    }
    Ok(coeffs)
}

fn indices(iter: impl Iterator<Item = u32>) -> Result<Vec<u32>, IbeError> {
    let mut seen = Vec::new();
    for index in iter {
        if index == 0 {
            return Err(IbeError::ZeroIndex);
        }
        if seen.contains(&index) {
            return Err(IbeError::DuplicateIndex(index));
        }
        seen.push(index);
    }
    if seen.is_empty() {
        return Err(IbeError::EmptyCommittee);
    }
    Ok(seen)
}

fn ser_compressed<T: CanonicalSerialize>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    let Ok(()) = value.serialize_compressed(&mut out) else {
        unreachable!("serialization into a Vec cannot fail");
    };
    out
}

fn de_compressed<T: CanonicalDeserialize>(bytes: &[u8]) -> Result<T, IbeError> {
    T::deserialize_compressed(bytes).map_err(|e| IbeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn committee(n: u32, rng: &mut StdRng) -> Vec<MasterShare> {
        (1..=n).map(|i| MasterShare::generate(i, rng)).collect()
    }

    fn master_public(shares: &[MasterShare]) -> MasterPublicKey {
        let publics: Vec<_> = shares.iter().map(MasterShare::public_share).collect();
        combine_master_public(&publics).unwrap()
    }

    fn identity_key(shares: &[MasterShare], identity: &str) -> IdentityPrivateKey {
        let key_shares: Vec<_> = shares.iter().map(|s| s.extract(identity)).collect();
        combine_private_key(&key_shares).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let mut rng = rng();
        let shares = committee(3, &mut rng);
        let mpk = master_public(&shares);

        let ct = encrypt(&mpk, "bob@example.org", b"friend request", &mut rng);
        let key = identity_key(&shares, "bob@example.org");

        assert_eq!(decrypt(&key, &ct).unwrap(), b"friend request");
    }

    #[test]
    fn wrong_identity_key_fails_silently() {
        let mut rng = rng();
        let shares = committee(3, &mut rng);
        let mpk = master_public(&shares);

        let ct = encrypt(&mpk, "bob@example.org", b"friend request", &mut rng);
        let wrong = identity_key(&shares, "carol@example.org");

        assert!(decrypt(&wrong, &ct).is_none());
    }

    #[test]
    fn missing_share_yields_unusable_key() {
        let mut rng = rng();
        let shares = committee(3, &mut rng);
        let mpk = master_public(&shares);

        let ct = encrypt(&mpk, "bob@example.org", b"secret", &mut rng);

        // Combining only two of three shares reconstructs the wrong secret.
        let partial: Vec<_> =
            shares[..2].iter().map(|s| s.extract("bob@example.org")).collect();
        let bad_key = combine_private_key(&partial).unwrap();

        assert!(decrypt(&bad_key, &ct).is_none());
    }

    #[test]
    fn verify_extraction_accepts_correct_key() {
        let mut rng = rng();
        let shares = committee(4, &mut rng);
        let mpk = master_public(&shares);
        let key = identity_key(&shares, "bob@example.org");

        assert!(verify_extraction(&mpk, "bob@example.org", &key));
        assert!(!verify_extraction(&mpk, "carol@example.org", &key));
    }

    #[test]
    fn single_pkg_committee_works() {
        let mut rng = rng();
        let shares = committee(1, &mut rng);
        let mpk = master_public(&shares);
        let key = identity_key(&shares, "bob@example.org");

        let ct = encrypt(&mpk, "bob@example.org", b"hi", &mut rng);
        assert_eq!(decrypt(&key, &ct).unwrap(), b"hi");
    }

    #[test]
    fn combine_rejects_empty_committee() {
        assert!(matches!(combine_master_public(&[]), Err(IbeError::EmptyCommittee)));
    }

    #[test]
    fn combine_rejects_duplicate_index() {
        let mut rng = rng();
        let a = MasterShare::generate(1, &mut rng).public_share();
        let b = MasterShare::generate(1, &mut rng).public_share();
        assert!(matches!(
            combine_master_public(&[a, b]),
            Err(IbeError::DuplicateIndex(1))
        ));
    }

    #[test]
    fn combine_rejects_zero_index() {
        let mut rng = rng();
        let share = MasterShare::generate(0, &mut rng).public_share();
        assert!(matches!(combine_master_public(&[share]), Err(IbeError::ZeroIndex)));
    }

    #[test]
    fn ciphertext_wire_roundtrip() {
        let mut rng = rng();
        let shares = committee(2, &mut rng);
        let mpk = master_public(&shares);

        let ct = encrypt(&mpk, "bob@example.org", b"payload", &mut rng);
        let decoded = IbeCiphertext::from_bytes(&ct.to_bytes()).unwrap();
        assert_eq!(decoded, ct);

        let key = identity_key(&shares, "bob@example.org");
        assert_eq!(decrypt(&key, &decoded).unwrap(), b"payload");
    }

    #[test]
    fn ciphertext_rejects_truncation() {
        let mut rng = rng();
        let shares = committee(2, &mut rng);
        let mpk = master_public(&shares);

        let bytes = encrypt(&mpk, "bob@example.org", b"payload", &mut rng).to_bytes();
        assert!(IbeCiphertext::from_bytes(&bytes[..40]).is_err());
    }

    #[test]
    fn share_wire_roundtrip() {
        let mut rng = rng();
        let share = MasterShare::generate(2, &mut rng);

        let public = share.public_share();
        let decoded = MasterPublicShare::from_bytes(2, &public.to_bytes()).unwrap();
        assert_eq!(decoded, public);

        let key_share = share.extract("bob@example.org");
        let decoded = PrivateKeyShare::from_bytes(2, &key_share.to_bytes()).unwrap();
        assert_eq!(decoded, key_share);
    }

    #[test]
    fn tampered_envelope_fails() {
        let mut rng = rng();
        let shares = committee(3, &mut rng);
        let mpk = master_public(&shares);
        let key = identity_key(&shares, "bob@example.org");

        let mut ct = encrypt(&mpk, "bob@example.org", b"payload", &mut rng);
        let last = ct.sealed.len() - 1;
        ct.sealed[last] ^= 0xFF;

        assert!(decrypt(&key, &ct).is_none());
    }
}
