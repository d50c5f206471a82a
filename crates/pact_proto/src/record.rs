//! The replicated ciphertext record.
//!
//! One `StoredMessage` per logical message. It carries only what a peer may
//! see: addressing, the ratchet envelope fields and replication metadata.
//! Plaintext never lives in this type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pact_crypto::ratchet::{MessageEnvelope, RatchetHeader, ENVELOPE_VERSION};

use crate::hlc::Hlc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Pending | MessageStatus::Failed => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
        }
    }

    /// Status only moves forward along pending→sent→delivered→read.
    /// `Failed` is reachable from pending/sent, and a failed message may
    /// move forward again once it is transmitted.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Pending | MessageStatus::Sent, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => MessageStatus::Pending,
            "sent" => MessageStatus::Sent,
            "delivered" => MessageStatus::Delivered,
            "read" => MessageStatus::Read,
            "failed" => MessageStatus::Failed,
            _ => return None,
        })
    }
}

/// Whether the local replica authored the record. Never sent on the wire:
/// anything deserialised from a peer is `Remote`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    #[default]
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// UUID v4, assigned by the store on create.
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    pub recipient_id: String,

    // ── Envelope fields ──────────────────────────────────────────────────
    pub dh_public_key: String,
    pub previous_chain_length: u64,
    pub message_index: u64,
    pub nonce: String,
    pub ciphertext: String,
    pub key_version: u8,
    pub sent_at: DateTime<Utc>,

    // ── Replication ──────────────────────────────────────────────────────
    pub status: MessageStatus,
    pub hlc: Hlc,
    #[serde(skip)]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Local tag: decrypt failed, ciphertext kept for audit / retry.
    #[serde(skip)]
    pub undecryptable: bool,
}

impl StoredMessage {
    /// Unsaved local record; the store assigns `id` and `hlc` on create.
    pub fn draft(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        envelope: &MessageEnvelope,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: String::new(),
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            dh_public_key: envelope.header.dh_public_key.clone(),
            previous_chain_length: envelope.header.previous_chain_length,
            message_index: envelope.header.message_number,
            nonce: envelope.iv.clone(),
            ciphertext: envelope.ciphertext.clone(),
            key_version: ENVELOPE_VERSION,
            sent_at: envelope.timestamp,
            status: MessageStatus::Pending,
            hlc: Hlc::ZERO,
            origin: Origin::Local,
            expires_at,
            undecryptable: false,
        }
    }

    /// Rebuild the ratchet envelope for decryption.
    pub fn envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            header: RatchetHeader {
                dh_public_key: self.dh_public_key.clone(),
                previous_chain_length: self.previous_chain_length,
                message_number: self.message_index,
            },
            iv: self.nonce.clone(),
            ciphertext: self.ciphertext.clone(),
            timestamp: self.sent_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_regresses() {
        use MessageStatus::*;
        assert!(Pending.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Delivered.can_advance_to(Read));
        assert!(Pending.can_advance_to(Read));
        assert!(!Read.can_advance_to(Delivered));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Failed));
        assert!(!Delivered.can_advance_to(Failed));
        assert!(Failed.can_advance_to(Sent));
        assert!(!Failed.can_advance_to(Pending));
    }

    #[test]
    fn local_only_fields_stay_off_the_wire() {
        let envelope = MessageEnvelope {
            header: RatchetHeader {
                dh_public_key: "AAAA".into(),
                previous_chain_length: 0,
                message_number: 3,
            },
            iv: "iv".into(),
            ciphertext: "ct".into(),
            timestamp: Utc::now(),
        };
        let mut record = StoredMessage::draft("s", "alice", "bob", &envelope, None);
        record.undecryptable = true;

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("origin").is_none());
        assert!(json.get("undecryptable").is_none());
        assert_eq!(json["messageIndex"], 3);

        let back: StoredMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.origin, Origin::Remote);
        assert!(!back.undecryptable);
        assert_eq!(back.envelope().header, envelope.header);
    }
}
