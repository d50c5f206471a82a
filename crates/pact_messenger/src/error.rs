use thiserror::Error;

use pact_crypto::CryptoError;
use pact_proto::CodecError;
use pact_store::StoreError;
use pact_sync::SyncError;

/// Errors surfaced to the application.
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("Secure key storage unavailable: {0}")]
    UnsupportedPlatform(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Session not initialised")]
    SessionNotInitialized,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Too many skipped messages: requested {requested}, limit {limit}")]
    TooManySkippedMessages { requested: u64, limit: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Malformed payload: {0}")]
    Payload(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CryptoError> for MessengerError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::UnsupportedPlatform(msg) => Self::UnsupportedPlatform(msg),
            CryptoError::AuthenticationFailed(msg) => Self::AuthenticationFailed(msg),
            CryptoError::SessionNotInitialized => Self::SessionNotInitialized,
            CryptoError::DecryptionFailed => Self::DecryptionFailed,
            CryptoError::TooManySkippedMessages { requested, limit } => {
                Self::TooManySkippedMessages { requested, limit }
            }
            other => Self::Crypto(other),
        }
    }
}

impl From<SyncError> for MessengerError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Store(inner) => Self::Storage(inner),
            SyncError::Codec(inner) => Self::Payload(inner),
            other => Self::Network(other.to_string()),
        }
    }
}

impl MessengerError {
    /// Worth retrying later without user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}
