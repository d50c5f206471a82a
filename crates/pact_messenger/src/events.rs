use chrono::{DateTime, Utc};

use pact_proto::{Hlc, MessagePayload, MessageStatus};
use pact_sync::ConnectionState;

/// Everything the UI layer is told about a session.
#[derive(Debug, Clone)]
pub enum HandlerEvent {
    /// A peer message decrypted successfully.
    Message {
        id: String,
        sender_id: String,
        sent_at: DateTime<Utc>,
        hlc: Hlc,
        payload: MessagePayload,
    },
    Typing(bool),
    ConnectionChanged(ConnectionState),
    StatusChanged {
        id: String,
        status: MessageStatus,
    },
    /// `id` names the record involved, if any. The record itself is kept.
    Error {
        id: Option<String>,
        error: String,
    },
    /// Outbound frames keep failing; offer a manual re-sync.
    ResyncRequired {
        pending: Vec<String>,
    },
    /// Disappearing messages removed by the sweeper.
    Expired {
        ids: Vec<String>,
    },
}
