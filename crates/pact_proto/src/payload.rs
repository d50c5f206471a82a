//! Plaintext carried inside a ratchet envelope.
//!
//! Serialised to JSON, padded with [`crate::codec::PaddingMode`], then
//! encrypted. Media bodies are never inlined; only a content reference
//! produced by the external media store travels here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

pub const PAYLOAD_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        /// Content address in the external media store.
        reference: String,
        mime_type: String,
        size_bytes: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub version: u8,
    pub content: MessageContent,
    /// Caller-supplied metadata, opaque to the core.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl MessagePayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            content: MessageContent::Text { body: body.into() },
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Body text, if this is a text message.
    pub fn body(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { body } => Some(body),
            MessageContent::Media { .. } => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_shape() {
        let mut meta = BTreeMap::new();
        meta.insert("reply_to".to_string(), "m-7".to_string());
        let payload = MessagePayload::text("hello").with_metadata(meta);

        let json: serde_json::Value = serde_json::from_slice(&payload.to_bytes().unwrap()).unwrap();
        assert_eq!(json["content"]["type"], "text");
        assert_eq!(json["metadata"]["reply_to"], "m-7");

        let back = MessagePayload::from_bytes(&payload.to_bytes().unwrap()).unwrap();
        assert_eq!(back.body(), Some("hello"));
    }

    #[test]
    fn media_payload_has_no_body() {
        let payload = MessagePayload {
            version: PAYLOAD_VERSION,
            content: MessageContent::Media {
                reference: "bafy...".into(),
                mime_type: "image/png".into(),
                size_bytes: 10,
            },
            metadata: BTreeMap::new(),
        };
        assert!(payload.body().is_none());
        assert!(MessagePayload::from_bytes(b"{").is_err());
    }
}
