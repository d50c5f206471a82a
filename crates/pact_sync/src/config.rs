use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on frames held while offline.
    pub max_outbound: usize,
    /// Failed attempts on one frame before a manual re-sync is requested.
    pub max_send_attempts: u32,
    /// Peer typing indicator clears after this much silence.
    pub typing_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_outbound: 512,
            max_send_attempts: 5,
            typing_timeout_ms: 5_000,
        }
    }
}
