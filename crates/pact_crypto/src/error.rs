use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Secure key storage unavailable on this platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Session not initialised")]
    SessionNotInitialized,

    #[error("AEAD decryption failed (authentication tag mismatch, possible tampering)")]
    DecryptionFailed,

    #[error("AEAD encryption failed")]
    EncryptionFailed,

    #[error("Too many skipped messages ({requested} > {limit})")]
    TooManySkippedMessages { requested: u64, limit: u64 },

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Key not found in secure store: {0}")]
    KeyNotFound(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
