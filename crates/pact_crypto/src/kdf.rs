//! Key derivation functions
//!
//! `kdf_rk`: HKDF-SHA256 root KDF: (root key, DH output) → (root key', chain key).
//! `kdf_ck`: HMAC-SHA256 chain KDF: chain key → (chain key', message key).
//! `vault_key_from_password`: Argon2id, derives the key that encrypts the
//!   local store's sensitive columns.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// 32 bytes of symmetric key material (root, chain or message key).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(pub(crate) [u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

// ── Ratchet KDFs ──────────────────────────────────────────────────────────────

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
pub fn kdf_rk(
    root_key: &SymmetricKey,
    dh_output: &[u8],
) -> Result<(SymmetricKey, SymmetricKey), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(b"pact-ratchet-root-v1", &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut rk = [0u8; 32];
    let mut ck = [0u8; 32];
    rk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((SymmetricKey(rk), SymmetricKey(ck)))
}

/// KDF_CK: advance a chain key one step.
/// Returns (next_chain_key, message_key).
pub fn kdf_ck(chain_key: &SymmetricKey) -> Result<(SymmetricKey, SymmetricKey), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(chain_key.as_bytes())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x02]);
    let next_ck: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = HmacSha256::new_from_slice(chain_key.as_bytes())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x01]);
    let mk: [u8; 32] = mac.finalize().into_bytes().into();

    Ok((SymmetricKey(next_ck), SymmetricKey(mk)))
}

// ── Vault key (Argon2id) ──────────────────────────────────────────────────────

/// 32-byte vault key derived from a passphrase. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey(pub [u8; 32]);

fn argon2_params() -> Result<Params, CryptoError> {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost
        1,         // p_cost
        Some(32),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a vault key from a passphrase + 16-byte salt.
pub fn vault_key_from_password(password: &[u8], salt: &[u8; 16]) -> Result<VaultKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params()?);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(VaultKey(output))
}

pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_step_separates_message_and_chain_keys() {
        let ck = SymmetricKey([3u8; 32]);
        let (next, mk) = kdf_ck(&ck).unwrap();
        assert_ne!(next, mk);
        assert_ne!(next, ck);

        let (next2, mk2) = kdf_ck(&next).unwrap();
        assert_ne!(mk, mk2);
        assert_ne!(next, next2);
    }

    #[test]
    fn root_kdf_is_deterministic() {
        let rk = SymmetricKey([1u8; 32]);
        let (a_rk, a_ck) = kdf_rk(&rk, b"dh-output").unwrap();
        let (b_rk, b_ck) = kdf_rk(&rk, b"dh-output").unwrap();
        assert_eq!(a_rk, b_rk);
        assert_eq!(a_ck, b_ck);
        let (c_rk, _) = kdf_rk(&rk, b"other-output").unwrap();
        assert_ne!(a_rk, c_rk);
    }
}
