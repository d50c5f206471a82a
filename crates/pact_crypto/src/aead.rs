//! Authenticated Encryption with Associated Data
//!
//! Uses AES-256-GCM (96-bit nonce).
//! Key size: 32 bytes.  Nonce: 12 bytes (random, fresh per message).  Tag: 16 bytes.
//!
//! Ratchet envelopes carry the nonce in a separate field (`iv`); the vault
//! helpers `seal` / `open` use the packed format `[ nonce (12) | ct + tag ]`.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 12;

/// Fresh random 96-bit nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn encrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload { msg: plaintext, aad },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub fn decrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload { msg: ciphertext, aad },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt with a random nonce prepended to the output.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = generate_nonce();
    let ct = encrypt(key, &nonce, plaintext, aad)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Inverse of [`seal`].
pub fn open(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, ct) = data.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| CryptoError::DecryptionFailed)?;
    decrypt(key, &nonce, ct, aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = [7u8; 32];
        let mut sealed = seal(&key, b"attack at dawn", b"aad").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            open(&key, &sealed, b"aad"),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn associated_data_is_authenticated() {
        let key = [9u8; 32];
        let nonce = generate_nonce();
        let ct = encrypt(&key, &nonce, b"payload", b"header-a").unwrap();
        assert!(decrypt(&key, &nonce, &ct, b"header-b").is_err());
        assert_eq!(&*decrypt(&key, &nonce, &ct, b"header-a").unwrap(), b"payload");
    }
}
