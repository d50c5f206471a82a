//! pact_crypto: Pact Secure Channel key provider and session ratchet
//!
//! # Design principles
//! - All primitives come from audited Rust crates (RustCrypto, dalek, BLAKE3).
//! - Private asymmetric keys live behind opaque handles issued by a
//!   [`provider::KeyProvider`]; callers only ever see public halves.
//! - Symmetric key material is zeroized on drop.
//!
//! # Module layout
//! - `provider`: key provider trait, key handles, software provider, unlock
//! - `keys`: public key newtype + display fingerprints
//! - `ratchet`: ratchet state machine, header / envelope, snapshots
//! - `skipped`: bounded skipped message-key cache
//! - `engine`: per-session serialised ratchet engine
//! - `aead`: AES-256-GCM helpers (96-bit nonces)
//! - `kdf`: root / chain KDFs, HKDF and Argon2id helpers
//! - `error`: unified error type

pub mod aead;
pub mod engine;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod provider;
pub mod ratchet;
pub mod skipped;

pub use engine::RatchetEngine;
pub use error::CryptoError;
pub use keys::PublicKeyBytes;
pub use provider::{
    CredentialHandle, ExchangeKeyHandle, Identity, KeyProvider, PresenceVerifier,
    SigningKeyHandle, SoftwareKeyProvider,
};
pub use ratchet::{MessageEnvelope, RatchetConfig, RatchetHeader, RatchetSnapshot};

/// X25519 public key used for ratchet exchanges.
pub use x25519_dalek::PublicKey as ExchangePublicKey;
