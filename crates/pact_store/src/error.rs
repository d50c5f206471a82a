use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked: unlock before reading or writing sealed columns")]
    VaultLocked,

    #[error("Crypto error: {0}")]
    Crypto(#[from] pact_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Duplicate(String),

    #[error("Corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Migration error: {0}")]
    Migration(String),
}
