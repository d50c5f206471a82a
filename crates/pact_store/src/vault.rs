//! Vault: in-memory key for sealed columns.
//!
//! Message bodies and ratchet snapshots are sealed under a 32-byte vault key
//! held only while the vault is unlocked. Locking drops (and zeroizes) the
//! key. An optional idle timeout locks the vault automatically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tokio::sync::RwLock;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use pact_crypto::{aead, kdf::vault_key_from_password};

use crate::error::StoreError;

#[derive(ZeroizeOnDrop)]
struct VaultInner {
    key: [u8; 32],
    #[zeroize(skip)]
    last_activity: Instant,
    #[zeroize(skip)]
    idle_timeout: Option<Duration>,
}

impl VaultInner {
    fn idle_expired(&self) -> bool {
        self.idle_timeout
            .is_some_and(|limit| self.last_activity.elapsed() > limit)
    }
}

/// Shared vault handle. Clones refer to the same key slot.
#[derive(Clone, Default)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultInner>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the key from a password (Argon2id) and unlock.
    pub async fn unlock(&self, password: &[u8], salt: &[u8; 16]) -> Result<(), StoreError> {
        let vault_key = vault_key_from_password(password, salt)?;
        self.install(vault_key.0).await;
        Ok(())
    }

    /// Unlock with a key from elsewhere (OS keyring, tests).
    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        self.install(key).await;
    }

    async fn install(&self, key: [u8; 32]) {
        let mut guard = self.inner.write().await;
        let idle_timeout = guard.as_ref().and_then(|v| v.idle_timeout);
        *guard = Some(VaultInner {
            key,
            last_activity: Instant::now(),
            idle_timeout,
        });
        tracing::debug!("vault unlocked");
    }

    pub async fn lock(&self) {
        *self.inner.write().await = None;
        tracing::debug!("vault locked");
    }

    pub async fn is_locked(&self) -> bool {
        match self.inner.read().await.as_ref() {
            Some(inner) => inner.idle_expired(),
            None => true,
        }
    }

    /// `None` disables the idle lock.
    pub async fn set_idle_timeout(&self, timeout: Option<Duration>) {
        if let Some(inner) = self.inner.write().await.as_mut() {
            inner.idle_timeout = timeout;
        }
    }

    /// Run `f` with the raw key. Fails if locked or the idle timeout passed.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let mut guard = self.inner.write().await;
        if guard.as_ref().is_some_and(VaultInner::idle_expired) {
            *guard = None;
            tracing::info!("vault idle timeout reached, locking");
        }
        match guard.as_mut() {
            Some(inner) => {
                inner.last_activity = Instant::now();
                f(&inner.key)
            }
            None => Err(StoreError::VaultLocked),
        }
    }

    /// Seal `plaintext` bound to `context`, base64 for a TEXT column.
    pub async fn seal(&self, plaintext: &[u8], context: &str) -> Result<String, StoreError> {
        let aad = aad_for(context);
        self.with_key(|key| {
            let sealed = aead::seal(key, plaintext, &aad)?;
            Ok(URL_SAFE_NO_PAD.encode(sealed))
        })
        .await
    }

    pub async fn open(&self, sealed_b64: &str, context: &str) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(sealed_b64)
            .map_err(|e| StoreError::Crypto(e.into()))?;
        let aad = aad_for(context);
        self.with_key(|key| Ok(aead::open(key, &sealed, &aad)?)).await
    }
}

fn aad_for(context: &str) -> Vec<u8> {
    let mut aad = b"pact-store-v1:".to_vec();
    aad.extend_from_slice(context.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locked_vault_refuses_work() {
        let vault = Vault::new();
        assert!(vault.is_locked().await);
        assert!(matches!(vault.seal(b"x", "ctx").await, Err(StoreError::VaultLocked)));

        vault.unlock_with_key([3u8; 32]).await;
        let sealed = vault.seal(b"secret", "body:1").await.unwrap();
        assert_eq!(&*vault.open(&sealed, "body:1").await.unwrap(), b"secret");

        vault.lock().await;
        assert!(matches!(vault.open(&sealed, "body:1").await, Err(StoreError::VaultLocked)));
    }

    #[tokio::test]
    async fn sealed_value_is_bound_to_its_context() {
        let vault = Vault::new();
        vault.unlock_with_key([4u8; 32]).await;
        let sealed = vault.seal(b"secret", "body:1").await.unwrap();
        assert!(matches!(vault.open(&sealed, "body:2").await, Err(StoreError::Crypto(_))));
    }

    #[tokio::test]
    async fn idle_timeout_locks() {
        let vault = Vault::new();
        vault.unlock_with_key([5u8; 32]).await;
        vault.set_idle_timeout(Some(Duration::from_millis(1))).await;
        std::thread::sleep(Duration::from_millis(10));
        assert!(vault.is_locked().await);
        assert!(matches!(vault.seal(b"x", "c").await, Err(StoreError::VaultLocked)));
    }

    #[tokio::test]
    async fn password_unlock_is_deterministic() {
        let salt = [1u8; 16];
        let a = Vault::new();
        a.unlock(b"hunter2", &salt).await.unwrap();
        let sealed = a.seal(b"payload", "c").await.unwrap();

        let b = Vault::new();
        b.unlock(b"hunter2", &salt).await.unwrap();
        assert_eq!(&*b.open(&sealed, "c").await.unwrap(), b"payload");
    }
}
