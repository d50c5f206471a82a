//! Key provider: non-extractable key handles and presence-gated unlock.
//!
//! A [`KeyProvider`] owns a secure key store. It issues:
//!   - Ed25519 signing handles (identity, unlock credentials)
//!   - X25519 exchange handles (ratchet key pairs)
//!
//! Handles expose public keys plus `sign` / `derive_secret`; raw private
//! bytes never cross this boundary. Handles can be re-obtained by key id,
//! which is how ratchet state is restored after a restart.
//!
//! Secret backends:
//!   - [`MemorySecretStore`]: process memory (tests, ephemeral devices)
//!   - [`KeyringSecretStore`]: OS credential store via the `keyring` crate
//!
//! Unlock ceremony: `register(key_id)` binds a credential to a signing key;
//! `authenticate(credential)` asks the [`PresenceVerifier`] (biometric prompt
//! or similar) to confirm, then proves possession with a signed challenge.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use keyring::Entry;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::{error::CryptoError, keys::PublicKeyBytes};

const SIGNING_PREFIX: &str = "ed25519";
const EXCHANGE_PREFIX: &str = "x25519";

// ── Handles ──────────────────────────────────────────────────────────────────

pub trait SigningKeyHandle: Send + Sync {
    fn key_id(&self) -> &str;
    fn public_key(&self) -> PublicKeyBytes;
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait ExchangeKeyHandle: Send + Sync {
    fn key_id(&self) -> &str;
    fn public_key(&self) -> X25519Public;
    /// X25519 shared secret with `peer`. Rejects non-contributory results.
    fn derive_secret(&self, peer: &X25519Public) -> Result<Zeroizing<[u8; 32]>, CryptoError>;
}

/// Long-term identity: one signing pair + one exchange pair.
#[derive(Clone)]
pub struct Identity {
    pub signing: Arc<dyn SigningKeyHandle>,
    pub exchange: Arc<dyn ExchangeKeyHandle>,
}

impl Identity {
    pub fn fingerprint(&self) -> String {
        self.signing.public_key().fingerprint()
    }
}

/// Opaque credential returned by `register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialHandle {
    pub credential_id: String,
    pub key_id: String,
    pub public_key: PublicKeyBytes,
}

#[async_trait]
pub trait PresenceVerifier: Send + Sync {
    /// Ask the user to confirm presence. `false` means rejected or cancelled.
    async fn confirm(&self, reason: &str) -> bool;
}

/// Fixed answer, for headless use and tests.
pub struct StaticPresence(pub bool);

#[async_trait]
impl PresenceVerifier for StaticPresence {
    async fn confirm(&self, _reason: &str) -> bool {
        self.0
    }
}

#[async_trait]
pub trait KeyProvider: Send + Sync {
    fn generate_identity(&self) -> Result<Identity, CryptoError>;
    fn generate_signing_key(&self) -> Result<Arc<dyn SigningKeyHandle>, CryptoError>;
    fn generate_exchange_pair(&self) -> Result<Arc<dyn ExchangeKeyHandle>, CryptoError>;
    fn load_signing_key(&self, key_id: &str) -> Result<Arc<dyn SigningKeyHandle>, CryptoError>;
    fn load_exchange_pair(&self, key_id: &str) -> Result<Arc<dyn ExchangeKeyHandle>, CryptoError>;
    fn destroy_key(&self, key_id: &str) -> Result<(), CryptoError>;

    async fn register(&self, key_id: &str) -> Result<CredentialHandle, CryptoError>;
    async fn authenticate(&self, credential: &CredentialHandle) -> Result<bool, CryptoError>;
}

// ── Secret backends ──────────────────────────────────────────────────────────

pub trait SecretStore: Send + Sync {
    fn put(&self, key_id: &str, secret: &[u8; 32]) -> Result<(), CryptoError>;
    fn get(&self, key_id: &str) -> Result<Option<Zeroizing<[u8; 32]>>, CryptoError>;
    fn delete(&self, key_id: &str) -> Result<(), CryptoError>;
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Zeroizing<[u8; 32]>>>,
}

impl SecretStore for MemorySecretStore {
    fn put(&self, key_id: &str, secret: &[u8; 32]) -> Result<(), CryptoError> {
        self.secrets
            .lock()
            .insert(key_id.to_string(), Zeroizing::new(*secret));
        Ok(())
    }

    fn get(&self, key_id: &str) -> Result<Option<Zeroizing<[u8; 32]>>, CryptoError> {
        Ok(self.secrets.lock().get(key_id).cloned())
    }

    fn delete(&self, key_id: &str) -> Result<(), CryptoError> {
        self.secrets.lock().remove(key_id);
        Ok(())
    }
}

/// OS credential store. Any backend failure maps to `UnsupportedPlatform`.
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: &str) -> Result<Self, CryptoError> {
        Entry::new(service, "probe").map_err(|e| CryptoError::UnsupportedPlatform(e.to_string()))?;
        Ok(Self { service: service.to_string() })
    }

    fn entry(&self, key_id: &str) -> Result<Entry, CryptoError> {
        Entry::new(&self.service, key_id).map_err(|e| CryptoError::UnsupportedPlatform(e.to_string()))
    }
}

impl SecretStore for KeyringSecretStore {
    fn put(&self, key_id: &str, secret: &[u8; 32]) -> Result<(), CryptoError> {
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(secret));
        self.entry(key_id)?
            .set_password(&encoded)
            .map_err(|e| CryptoError::UnsupportedPlatform(format!("store key: {e}")))
    }

    fn get(&self, key_id: &str) -> Result<Option<Zeroizing<[u8; 32]>>, CryptoError> {
        let encoded = match self.entry(key_id)?.get_password() {
            Ok(s) => Zeroizing::new(s),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(CryptoError::UnsupportedPlatform(format!("load key: {e}"))),
        };
        let decoded = Zeroizing::new(general_purpose::STANDARD.decode(encoded.as_bytes())?);
        let arr: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("stored secret is not 32 bytes".into()))?;
        Ok(Some(Zeroizing::new(arr)))
    }

    fn delete(&self, key_id: &str) -> Result<(), CryptoError> {
        match self.entry(key_id)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CryptoError::UnsupportedPlatform(format!("delete key: {e}"))),
        }
    }
}

// ── Software handles ─────────────────────────────────────────────────────────

struct SoftwareSigningKey {
    key_id: String,
    signing: SigningKey,
}

impl SigningKeyHandle for SoftwareSigningKey {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes(self.signing.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signing.sign(msg).to_bytes().to_vec())
    }
}

struct SoftwareExchangeKey {
    key_id: String,
    secret: StaticSecret,
    public: X25519Public,
}

impl ExchangeKeyHandle for SoftwareExchangeKey {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn public_key(&self) -> X25519Public {
        self.public
    }

    fn derive_secret(&self, peer: &X25519Public) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("non-contributory DH output".into()));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

// ── Software provider ────────────────────────────────────────────────────────

/// Key provider backed by a [`SecretStore`].
pub struct SoftwareKeyProvider {
    store: Box<dyn SecretStore>,
    presence: Arc<dyn PresenceVerifier>,
    credentials: Mutex<HashMap<String, CredentialHandle>>,
}

impl SoftwareKeyProvider {
    pub fn new(store: Box<dyn SecretStore>, presence: Arc<dyn PresenceVerifier>) -> Self {
        Self {
            store,
            presence,
            credentials: Mutex::new(HashMap::new()),
        }
    }

    /// Ephemeral provider; presence is auto-approved.
    pub fn in_memory() -> Self {
        Self::new(Box::<MemorySecretStore>::default(), Arc::new(StaticPresence(true)))
    }

    pub fn with_keyring(service: &str, presence: Arc<dyn PresenceVerifier>) -> Result<Self, CryptoError> {
        Ok(Self::new(Box::new(KeyringSecretStore::new(service)?), presence))
    }

    fn new_key_id(prefix: &str) -> String {
        format!("{prefix}:{}", uuid::Uuid::new_v4())
    }

    fn load_secret(&self, key_id: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        self.store
            .get(key_id)?
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))
    }
}

#[async_trait]
impl KeyProvider for SoftwareKeyProvider {
    fn generate_identity(&self) -> Result<Identity, CryptoError> {
        let signing = self.generate_signing_key()?;
        let exchange = self.generate_exchange_pair()?;
        tracing::info!(
            signing_key = signing.key_id(),
            exchange_key = exchange.key_id(),
            "generated identity"
        );
        Ok(Identity { signing, exchange })
    }

    fn generate_signing_key(&self) -> Result<Arc<dyn SigningKeyHandle>, CryptoError> {
        let signing = SigningKey::generate(&mut OsRng);
        let key_id = Self::new_key_id(SIGNING_PREFIX);
        self.store.put(&key_id, &signing.to_bytes())?;
        Ok(Arc::new(SoftwareSigningKey { key_id, signing }))
    }

    fn generate_exchange_pair(&self) -> Result<Arc<dyn ExchangeKeyHandle>, CryptoError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let key_id = Self::new_key_id(EXCHANGE_PREFIX);
        self.store.put(&key_id, &Zeroizing::new(secret.to_bytes()))?;
        Ok(Arc::new(SoftwareExchangeKey { key_id, secret, public }))
    }

    fn load_signing_key(&self, key_id: &str) -> Result<Arc<dyn SigningKeyHandle>, CryptoError> {
        if !key_id.starts_with(SIGNING_PREFIX) {
            return Err(CryptoError::InvalidKey(format!("{key_id} is not a signing key")));
        }
        let secret = self.load_secret(key_id)?;
        Ok(Arc::new(SoftwareSigningKey {
            key_id: key_id.to_string(),
            signing: SigningKey::from_bytes(&secret),
        }))
    }

    fn load_exchange_pair(&self, key_id: &str) -> Result<Arc<dyn ExchangeKeyHandle>, CryptoError> {
        if !key_id.starts_with(EXCHANGE_PREFIX) {
            return Err(CryptoError::InvalidKey(format!("{key_id} is not an exchange key")));
        }
        let secret = StaticSecret::from(*self.load_secret(key_id)?);
        let public = X25519Public::from(&secret);
        Ok(Arc::new(SoftwareExchangeKey {
            key_id: key_id.to_string(),
            secret,
            public,
        }))
    }

    fn destroy_key(&self, key_id: &str) -> Result<(), CryptoError> {
        self.store.delete(key_id)
    }

    async fn register(&self, key_id: &str) -> Result<CredentialHandle, CryptoError> {
        let signing = self.load_signing_key(key_id)?;
        let credential = CredentialHandle {
            credential_id: uuid::Uuid::new_v4().to_string(),
            key_id: key_id.to_string(),
            public_key: signing.public_key(),
        };
        self.credentials
            .lock()
            .insert(credential.credential_id.clone(), credential.clone());
        tracing::info!(credential = %credential.credential_id, "registered unlock credential");
        Ok(credential)
    }

    async fn authenticate(&self, credential: &CredentialHandle) -> Result<bool, CryptoError> {
        let registered = self.credentials.lock().get(&credential.credential_id).cloned();
        let Some(registered) = registered else {
            tracing::warn!(credential = %credential.credential_id, "unknown credential");
            return Ok(false);
        };
        if registered != *credential {
            return Ok(false);
        }

        if !self.presence.confirm("Unlock Pact").await {
            return Err(CryptoError::AuthenticationFailed(
                "presence check rejected or cancelled".into(),
            ));
        }

        let mut challenge = [0u8; 32];
        OsRng.fill_bytes(&mut challenge);
        let signing = self.load_signing_key(&registered.key_id)?;
        let signature = signing.sign(&challenge)?;
        Ok(registered.public_key.verify(&challenge, &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_handles_agree_and_reload() {
        let provider = SoftwareKeyProvider::in_memory();
        let a = provider.generate_exchange_pair().unwrap();
        let b = provider.generate_exchange_pair().unwrap();

        let ab = a.derive_secret(&b.public_key()).unwrap();
        let ba = b.derive_secret(&a.public_key()).unwrap();
        assert_eq!(*ab, *ba);

        let reloaded = provider.load_exchange_pair(a.key_id()).unwrap();
        assert_eq!(reloaded.public_key(), a.public_key());

        provider.destroy_key(a.key_id()).unwrap();
        assert!(matches!(
            provider.load_exchange_pair(a.key_id()),
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[test]
    fn identity_fingerprint_matches_signing_key() {
        let provider = SoftwareKeyProvider::in_memory();
        let identity = provider.generate_identity().unwrap();
        assert_eq!(identity.fingerprint(), identity.signing.public_key().fingerprint());

        let sig = identity.signing.sign(b"hello").unwrap();
        identity.signing.public_key().verify(b"hello", &sig).unwrap();
        assert!(identity.signing.public_key().verify(b"other", &sig).is_err());
    }

    #[tokio::test]
    async fn authenticate_with_registered_credential() {
        let provider = SoftwareKeyProvider::in_memory();
        let signing = provider.generate_signing_key().unwrap();
        let credential = provider.register(signing.key_id()).await.unwrap();
        assert!(provider.authenticate(&credential).await.unwrap());

        let forged = CredentialHandle {
            credential_id: "not-registered".into(),
            ..credential
        };
        assert!(!provider.authenticate(&forged).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_presence_fails_authentication() {
        let provider = SoftwareKeyProvider::new(
            Box::<MemorySecretStore>::default(),
            Arc::new(StaticPresence(false)),
        );
        let signing = provider.generate_signing_key().unwrap();
        let credential = provider.register(signing.key_id()).await.unwrap();
        assert!(matches!(
            provider.authenticate(&credential).await,
            Err(CryptoError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn key_kinds_are_not_interchangeable() {
        let provider = SoftwareKeyProvider::in_memory();
        let signing = provider.generate_signing_key().unwrap();
        assert!(provider.load_exchange_pair(signing.key_id()).is_err());
    }
}
