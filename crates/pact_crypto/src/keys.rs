//! Public key bytes and human-verifiable fingerprints.
//!
//! Private halves never appear here: they stay behind the handles issued by
//! [`crate::provider::KeyProvider`].

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// 32-byte public key (Ed25519 or X25519), base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// BLAKE3 of the raw key truncated to 160 bits, hex in groups of 4.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }

    /// Verify an Ed25519 signature made by this key.
    pub fn verify(&self, msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let raw: [u8; 32] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?;
        let vk = VerifyingKey::from_bytes(&raw).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }
}

impl From<&x25519_dalek::PublicKey> for PublicKeyBytes {
    fn from(key: &x25519_dalek::PublicKey) -> Self {
        Self(key.as_bytes().to_vec())
    }
}

/// Grouped display fingerprint for any raw public key.
pub fn fingerprint(raw_public_key: &[u8]) -> String {
    let hash = blake3::hash(raw_public_key);
    hex::encode(&hash.as_bytes()[..20])
        .as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode a base64url X25519 public key as carried in ratchet headers.
pub fn exchange_key_from_b64(s: &str) -> Result<x25519_dalek::PublicKey, CryptoError> {
    let bytes = URL_SAFE_NO_PAD.decode(s)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ratchet public key must be 32 bytes".into()))?;
    Ok(x25519_dalek::PublicKey::from(arr))
}

pub fn exchange_key_to_b64(key: &x25519_dalek::PublicKey) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_ten_groups_of_four() {
        let key = PublicKeyBytes(vec![5u8; 32]);
        let fp = key.fingerprint();
        let groups: Vec<&str> = fp.split(' ').collect();
        assert_eq!(groups.len(), 10);
        assert!(groups.iter().all(|g| g.len() == 4));
        assert_eq!(fp, PublicKeyBytes(vec![5u8; 32]).fingerprint());
        assert_ne!(fp, PublicKeyBytes(vec![6u8; 32]).fingerprint());
    }

    #[test]
    fn rejects_short_keys() {
        let short = URL_SAFE_NO_PAD.encode([1u8; 16]);
        assert!(PublicKeyBytes::from_b64(&short).is_err());
        assert!(exchange_key_from_b64(&short).is_err());
    }
}
