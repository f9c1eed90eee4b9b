//! Serde helpers for JSON-visible binary fields.
//!
//! The persisted client blob and every config on the wire encode binary data
//! as standard base64 strings. These modules plug into `#[serde(with = ..)]`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// `Vec<u8>` as a standard-base64 string.
pub mod b64 {
    use super::*;

    /// Serialize bytes as base64.
    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(bytes).serialize(ser)
    }

    /// Deserialize base64 into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// `[u8; 32]` as a standard-base64 string.
pub mod b64_array {
    use super::*;

    /// Serialize a 32-byte array as base64.
    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(bytes).serialize(ser)
    }

    /// Deserialize base64 into a 32-byte array.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let bytes = BASE64.decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| serde::de::Error::custom(format!("want 32 bytes, got {}", b.len())))
    }
}

/// `Vec<Vec<u8>>` as a list of standard-base64 strings.
pub mod b64_vec {
    use super::*;

    /// Serialize each element as base64.
    pub fn serialize<S: Serializer>(items: &Vec<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        items.iter().map(|b| BASE64.encode(b)).collect::<Vec<_>>().serialize(ser)
    }

    /// Deserialize a list of base64 strings.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let strings = Vec::<String>::deserialize(de)?;
        strings.into_iter().map(|s| BASE64.decode(s).map_err(serde::de::Error::custom)).collect()
    }
}

/// `Vec<[u8; 32]>` as a list of standard-base64 strings.
pub mod b64_array_vec {
    use super::*;

    /// Serialize each 32-byte array as base64.
    pub fn serialize<S: Serializer>(items: &Vec<[u8; 32]>, ser: S) -> Result<S::Ok, S::Error> {
        items.iter().map(|b| BASE64.encode(b)).collect::<Vec<_>>().serialize(ser)
    }

    /// Deserialize a list of base64 strings into 32-byte arrays.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<[u8; 32]>, D::Error> {
        let strings = Vec::<String>::deserialize(de)?;
        strings
            .into_iter()
            .map(|s| {
                let bytes = BASE64.decode(s).map_err(serde::de::Error::custom)?;
                bytes.try_into().map_err(|b: Vec<u8>| {
                    serde::de::Error::custom(format!("want 32 bytes, got {}", b.len()))
                })
            })
            .collect()
    }
}

/// `ed25519_dalek::VerifyingKey` as a standard-base64 string.
pub mod b64_verifying_key {
    use ed25519_dalek::VerifyingKey;

    use super::*;

    /// Serialize a verifying key as base64.
    pub fn serialize<S: Serializer>(key: &VerifyingKey, ser: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(key.as_bytes()).serialize(ser)
    }

    /// Deserialize base64 into a verifying key.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<VerifyingKey, D::Error> {
        let bytes = b64_array::deserialize(de)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// `ed25519_dalek::Signature` as a standard-base64 string.
pub mod b64_signature {
    use ed25519_dalek::Signature;

    use super::*;

    /// Serialize a signature as base64.
    pub fn serialize<S: Serializer>(sig: &Signature, ser: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(sig.to_bytes()).serialize(ser)
    }

    /// Deserialize base64 into a signature.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Signature, D::Error> {
        let s = String::deserialize(de)?;
        let bytes = BASE64.decode(s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| serde::de::Error::custom(format!("want 64 bytes, got {}", b.len())))?;
        Ok(Signature::from_bytes(&bytes))
    }
}
