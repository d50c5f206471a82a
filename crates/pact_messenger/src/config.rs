//! Messenger configuration.
//!
//! Every section has defaults, so a config file only names what it changes:
//!
//! ```json
//! { "disappear_after_secs": 86400, "sync": { "max_outbound": 128 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use pact_crypto::RatchetConfig;
use pact_proto::PaddingMode;
use pact_sync::SyncConfig;

use crate::error::MessengerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    pub ratchet: RatchetConfig,
    pub sync: SyncConfig,
    /// Sent messages expire this long after sending. `None` keeps them.
    pub disappear_after_secs: Option<u64>,
    /// How often the expiry sweeper runs.
    pub sweep_interval_secs: u64,
    pub padding: PaddingMode,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            ratchet: RatchetConfig::default(),
            sync: SyncConfig::default(),
            disappear_after_secs: None,
            sweep_interval_secs: 60,
            padding: PaddingMode::Buckets,
        }
    }
}

impl MessengerConfig {
    pub fn load(path: &Path) -> Result<Self, MessengerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MessengerError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| MessengerError::Config(format!("{}: {e}", path.display())))
    }
}
