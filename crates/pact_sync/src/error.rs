use thiserror::Error;

use pact_proto::CodecError;
use pact_store::StoreError;

use crate::channel::ChannelError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Outbound queue full ({limit} entries)")]
    QueueFull { limit: usize },

    #[error("Sync engine is in the terminal error state")]
    Terminal,

    #[error("Frame for session {got} arrived on session {expected}")]
    SessionMismatch { expected: String, got: String },
}
