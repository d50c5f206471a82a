//! Sync transport frames.
//!
//! Every frame on the channel is `{type, sessionId, payload, timestamp}`.
//! `payload` stays an untyped JSON value on the outer frame so a receiver
//! can route on `type` before committing to a payload shape; [`SyncFrame::decode`]
//! turns it into a typed [`SyncMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::hlc::Hlc;
use crate::record::{MessageStatus, StoredMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    SyncRequest,
    SyncResponse,
    Message,
    Ack,
    Typing,
    StatusUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub session_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Ask the peer for everything after `last_hlc`. `digest` is the
    /// sender's index digest; a peer holding the same digest answers empty.
    SyncRequest {
        last_hlc: Option<Hlc>,
        digest: Option<String>,
    },
    SyncResponse { records: Vec<StoredMessage> },
    Message { record: StoredMessage },
    Ack { id: String, status: MessageStatus },
    Typing { typing: bool },
    StatusUpdate { id: String, status: MessageStatus },
}

// ── Payload shapes ───────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequestPayload {
    #[serde(default)]
    last_hlc: Option<Hlc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RecordsPayload {
    records: Vec<StoredMessage>,
}

#[derive(Serialize, Deserialize)]
struct RecordPayload {
    record: StoredMessage,
}

#[derive(Serialize, Deserialize)]
struct StatusPayload {
    id: String,
    status: MessageStatus,
}

#[derive(Serialize, Deserialize)]
struct TypingPayload {
    typing: bool,
}

impl SyncMessage {
    pub fn kind(&self) -> FrameKind {
        match self {
            SyncMessage::SyncRequest { .. } => FrameKind::SyncRequest,
            SyncMessage::SyncResponse { .. } => FrameKind::SyncResponse,
            SyncMessage::Message { .. } => FrameKind::Message,
            SyncMessage::Ack { .. } => FrameKind::Ack,
            SyncMessage::Typing { .. } => FrameKind::Typing,
            SyncMessage::StatusUpdate { .. } => FrameKind::StatusUpdate,
        }
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            SyncMessage::SyncRequest { last_hlc, digest } => serde_json::to_value(SyncRequestPayload {
                last_hlc: *last_hlc,
                digest: digest.clone(),
            }),
            SyncMessage::SyncResponse { records } => serde_json::to_value(RecordsPayload {
                records: records.clone(),
            }),
            SyncMessage::Message { record } => serde_json::to_value(RecordPayload {
                record: record.clone(),
            }),
            SyncMessage::Ack { id, status } | SyncMessage::StatusUpdate { id, status } => {
                serde_json::to_value(StatusPayload {
                    id: id.clone(),
                    status: *status,
                })
            }
            SyncMessage::Typing { typing } => serde_json::to_value(TypingPayload { typing: *typing }),
        }
    }
}

impl SyncFrame {
    pub fn new(session_id: &str, message: &SyncMessage) -> Result<Self, CodecError> {
        Ok(Self {
            kind: message.kind(),
            session_id: session_id.to_string(),
            payload: message
                .to_payload()
                .map_err(|e| CodecError::Serialization(e.to_string()))?,
            timestamp: Utc::now(),
        })
    }

    pub fn decode(&self) -> Result<SyncMessage, CodecError> {
        let payload = self.payload.clone();
        let bad = |e: serde_json::Error| CodecError::MalformedPayload {
            kind: self.kind,
            reason: e.to_string(),
        };
        Ok(match self.kind {
            FrameKind::SyncRequest => {
                let p: SyncRequestPayload = serde_json::from_value(payload).map_err(bad)?;
                SyncMessage::SyncRequest {
                    last_hlc: p.last_hlc,
                    digest: p.digest,
                }
            }
            FrameKind::SyncResponse => {
                let p: RecordsPayload = serde_json::from_value(payload).map_err(bad)?;
                SyncMessage::SyncResponse { records: p.records }
            }
            FrameKind::Message => {
                let p: RecordPayload = serde_json::from_value(payload).map_err(bad)?;
                SyncMessage::Message { record: p.record }
            }
            FrameKind::Ack => {
                let p: StatusPayload = serde_json::from_value(payload).map_err(bad)?;
                SyncMessage::Ack {
                    id: p.id,
                    status: p.status,
                }
            }
            FrameKind::StatusUpdate => {
                let p: StatusPayload = serde_json::from_value(payload).map_err(bad)?;
                SyncMessage::StatusUpdate {
                    id: p.id,
                    status: p.status,
                }
            }
            FrameKind::Typing => {
                let p: TypingPayload = serde_json::from_value(payload).map_err(bad)?;
                SyncMessage::Typing { typing: p.typing }
            }
        })
    }
}
