//! pact_proto: Wire types and serialisation for Pact Secure Channel
//!
//! All on-wire types are JSON. The sync transport wraps every message in a
//! [`frame::SyncFrame`] `{type, sessionId, payload, timestamp}`.
//!
//! # Modules
//! - `hlc`: hybrid logical clock stamp (value type, ordering)
//! - `record`: the replicated ciphertext record and its delivery status
//! - `frame`: sync transport frames and typed payloads
//! - `payload`: plaintext inside an envelope (content + metadata)
//! - `codec`: frame encoding limits and plaintext padding

pub mod codec;
pub mod frame;
pub mod hlc;
pub mod payload;
pub mod record;

pub use codec::{CodecError, PaddingMode};
pub use frame::{FrameKind, SyncFrame, SyncMessage};
pub use hlc::Hlc;
pub use payload::{MessageContent, MessagePayload};
pub use record::{MessageStatus, Origin, StoredMessage};
