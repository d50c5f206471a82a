//! Database row models and their conversions.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use pact_proto::{Hlc, MessageStatus, Origin, StoredMessage};

use crate::error::StoreError;

/// Column list shared by every `SELECT` that yields a [`MessageRow`].
pub(crate) const MESSAGE_COLUMNS: &str = "id, session_id, sender_id, recipient_id, dh_public_key, \
     previous_chain_length, message_index, nonce, ciphertext, key_version, sent_at, status, \
     hlc_millis, hlc_counter, hlc_node, origin, expires_at_ms, undecryptable";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub dh_public_key: String,
    pub previous_chain_length: i64,
    pub message_index: i64,
    pub nonce: String,
    pub ciphertext: String,
    pub key_version: i64,
    pub sent_at: DateTime<Utc>,
    pub status: String,
    pub hlc_millis: i64,
    pub hlc_counter: i64,
    pub hlc_node: i64,
    pub origin: String,
    pub expires_at_ms: Option<i64>,
    pub undecryptable: bool,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            id: row.id.clone(),
            reason: reason.to_string(),
        };
        let status = MessageStatus::parse(&row.status).ok_or_else(|| corrupt("unknown status"))?;
        let origin = match row.origin.as_str() {
            "local" => Origin::Local,
            "remote" => Origin::Remote,
            _ => return Err(corrupt("unknown origin")),
        };
        let expires_at = match row.expires_at_ms {
            Some(ms) => Some(
                Utc.timestamp_millis_opt(ms)
                    .single()
                    .ok_or_else(|| corrupt("expiry out of range"))?,
            ),
            None => None,
        };
        Ok(StoredMessage {
            hlc: Hlc::new(row.hlc_millis as u64, row.hlc_counter as u32, row.hlc_node as u32),
            previous_chain_length: row.previous_chain_length as u64,
            message_index: row.message_index as u64,
            key_version: row.key_version as u8,
            status,
            origin,
            expires_at,
            undecryptable: row.undecryptable,
            id: row.id,
            session_id: row.session_id,
            sender_id: row.sender_id,
            recipient_id: row.recipient_id,
            dh_public_key: row.dh_public_key,
            nonce: row.nonce,
            ciphertext: row.ciphertext,
            sent_at: row.sent_at,
        })
    }
}

pub(crate) fn origin_str(origin: Origin) -> &'static str {
    match origin {
        Origin::Local => "local",
        Origin::Remote => "remote",
    }
}

/// Per-session reconciliation progress, owned by the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub last_reconciled: Option<Hlc>,
    /// Records accepted from each peer sender id.
    #[serde(default)]
    pub peer_counters: BTreeMap<String, u64>,
}

impl SyncState {
    /// Fold in a reconciled record. Never moves `last_reconciled` backwards.
    pub fn observe(&mut self, hlc: Hlc, sender_id: &str) {
        self.last_reconciled = Some(match self.last_reconciled {
            Some(current) => current.max(hlc),
            None => hlc,
        });
        *self.peer_counters.entry(sender_id.to_string()).or_insert(0) += 1;
    }
}

/// Result of [`crate::Store::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Record was absent and is now stored as remote origin.
    Inserted,
    /// Incoming HLC superseded the stored copy.
    Updated,
    /// Stored copy is as new or newer; nothing changed.
    Ignored,
    /// Already expired, or stamped too far in the future; not stored.
    Rejected,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Updated)
    }
}
