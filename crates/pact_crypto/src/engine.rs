//! Per-session ratchet engine.
//!
//! Encrypt and decrypt both read-then-overwrite chain keys, so every
//! operation takes the session mutex. The lock covers only synchronous key
//! schedule work; callers persist snapshots and perform I/O after it is
//! released.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use x25519_dalek::PublicKey as X25519Public;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    provider::{ExchangeKeyHandle, KeyProvider},
    ratchet::{MessageEnvelope, RatchetConfig, RatchetSnapshot, RatchetState},
};

pub struct RatchetEngine {
    session_id: String,
    provider: Arc<dyn KeyProvider>,
    config: RatchetConfig,
    state: Mutex<Option<RatchetState>>,
}

impl RatchetEngine {
    pub fn new(session_id: impl Into<String>, provider: Arc<dyn KeyProvider>, config: RatchetConfig) -> Self {
        Self {
            session_id: session_id.into(),
            provider,
            config,
            state: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn init_as_initiator(&self, shared_secret: [u8; 32], peer_public: &X25519Public) -> Result<(), CryptoError> {
        let state =
            RatchetState::init_initiator(self.provider.as_ref(), shared_secret, peer_public, &self.config)?;
        *self.state.lock() = Some(state);
        tracing::info!(session = %self.session_id, "ratchet initialised as initiator");
        Ok(())
    }

    pub fn init_as_responder(&self, shared_secret: [u8; 32], own_pair: Arc<dyn ExchangeKeyHandle>) {
        *self.state.lock() = Some(RatchetState::init_responder(shared_secret, own_pair, &self.config));
        tracing::info!(session = %self.session_id, "ratchet initialised as responder");
    }

    pub fn restore(&self, snapshot: RatchetSnapshot) -> Result<(), CryptoError> {
        let state = RatchetState::restore(snapshot, self.provider.as_ref(), &self.config)?;
        *self.state.lock() = Some(state);
        tracing::info!(session = %self.session_id, "ratchet restored from snapshot");
        Ok(())
    }

    pub fn snapshot(&self) -> Result<RatchetSnapshot, CryptoError> {
        self.state
            .lock()
            .as_ref()
            .map(RatchetState::snapshot)
            .ok_or(CryptoError::SessionNotInitialized)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<MessageEnvelope, CryptoError> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(CryptoError::SessionNotInitialized)?;
        state.encrypt(plaintext, Utc::now())
    }

    /// Decrypt against a working copy; commit only if the tag verifies.
    pub fn decrypt(&self, envelope: &MessageEnvelope) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut guard = self.state.lock();
        let committed = guard.as_mut().ok_or(CryptoError::SessionNotInitialized)?;

        let mut working = committed.clone();
        match working.decrypt(self.provider.as_ref(), envelope, &self.config, Utc::now()) {
            Ok(plaintext) => {
                let retired = working.take_retired();
                *committed = working;
                drop(guard);
                for key_id in retired {
                    if let Err(e) = self.provider.destroy_key(&key_id) {
                        tracing::warn!(session = %self.session_id, "failed to destroy retired key {key_id}: {e}");
                    }
                }
                Ok(plaintext)
            }
            Err(e) => {
                // A DH step on the working copy may have minted a key we now discard
                if working.own_key_id() != committed.own_key_id() {
                    let _ = self.provider.destroy_key(working.own_key_id());
                }
                tracing::warn!(session = %self.session_id, "decrypt failed: {e}");
                Err(e)
            }
        }
    }

    /// Drop skipped keys past the configured age.
    pub fn purge_expired(&self) -> usize {
        self.state
            .lock()
            .as_mut()
            .map(|s| s.purge_expired(Utc::now(), &self.config))
            .unwrap_or(0)
    }

    pub fn skipped_len(&self) -> usize {
        self.state.lock().as_ref().map(RatchetState::skipped_len).unwrap_or(0)
    }
}
