//! Frame encoding limits and plaintext padding.
//!
//! # Padding
//! Plaintext is padded to fixed buckets before encryption so ciphertext
//! lengths leak only the bucket. Layout: `[len: u32 LE][plaintext][random]`.
//! Bucket sizes (bytes): 256, 1024, 4096, 16384, 65536. Anything larger is
//! length-prefixed only.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::frame::{FrameKind, SyncFrame};

/// Frames above this size are refused in both directions.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const BUCKET_SIZES: &[usize] = &[256, 1024, 4096, 16384, 65536];
const MAX_BUCKET: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Length prefix only.
    None,
    #[default]
    Buckets,
    /// Every message padded to the largest bucket.
    Maximum,
}

impl PaddingMode {
    pub fn pad(self, plaintext: &[u8]) -> Vec<u8> {
        let needed = 4 + plaintext.len();
        let target = match self {
            PaddingMode::None => needed,
            PaddingMode::Buckets => BUCKET_SIZES
                .iter()
                .copied()
                .find(|&b| b >= needed)
                .unwrap_or(needed),
            PaddingMode::Maximum => needed.max(MAX_BUCKET),
        };

        let mut out = Vec::with_capacity(target);
        out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
        out.extend_from_slice(plaintext);
        let remaining = target - out.len();
        if remaining > 0 {
            // Random fill, not zeros, so compression cannot reveal the length
            let mut fill = vec![0u8; remaining];
            rand::rngs::OsRng.fill_bytes(&mut fill);
            out.extend_from_slice(&fill);
        }
        out
    }
}

/// Strip the padding added by [`PaddingMode::pad`], whatever the mode.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CodecError> {
    let prefix: [u8; 4] = padded
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| CodecError::InvalidPadding("too short for length prefix".into()))?;
    let len = u32::from_le_bytes(prefix) as usize;
    padded
        .get(4..4 + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            CodecError::InvalidPadding(format!(
                "length prefix {len} exceeds padded size {}",
                padded.len()
            ))
        })
}

pub fn encode_frame(frame: &SyncFrame) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(frame).map_err(|e| CodecError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode_frame(bytes: &[u8]) -> Result<SyncFrame, CodecError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(bytes.len()));
    }
    serde_json::from_slice(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("Malformed {kind:?} payload: {reason}")]
    MalformedPayload { kind: FrameKind, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SyncMessage;

    #[test]
    fn buckets_hide_length() {
        let short = PaddingMode::Buckets.pad(b"hi");
        let longer = PaddingMode::Buckets.pad(b"a somewhat longer message");
        assert_eq!(short.len(), 256);
        assert_eq!(longer.len(), 256);
        assert_eq!(unpad(&short).unwrap(), b"hi");

        let big = vec![0x42u8; 5000];
        let padded = PaddingMode::Buckets.pad(&big);
        assert_eq!(padded.len(), 16384);
        assert_eq!(unpad(&padded).unwrap(), big);
    }

    #[test]
    fn none_and_maximum_modes() {
        let padded = PaddingMode::None.pad(b"plain");
        assert_eq!(padded.len(), 9);
        assert_eq!(unpad(&padded).unwrap(), b"plain");

        let padded = PaddingMode::Maximum.pad(b"tiny");
        assert_eq!(padded.len(), 65536);
        assert_eq!(unpad(&padded).unwrap(), b"tiny");
    }

    #[test]
    fn corrupt_prefix_is_rejected() {
        assert!(matches!(unpad(&[1, 0]), Err(CodecError::InvalidPadding(_))));
        assert!(matches!(unpad(&[200, 0, 0, 0, 1]), Err(CodecError::InvalidPadding(_))));
    }

    #[test]
    fn frames_decode_and_garbage_fails() {
        let frame = SyncFrame::new("s", &SyncMessage::Typing { typing: true }).unwrap();
        let bytes = encode_frame(&frame).unwrap();
        let back = decode_frame(&bytes).unwrap();
        assert_eq!(back.decode().unwrap(), SyncMessage::Typing { typing: true });

        assert!(matches!(decode_frame(b"not json"), Err(CodecError::Serialization(_))));
        let huge = vec![b' '; MAX_FRAME_BYTES + 1];
        assert!(matches!(decode_frame(&huge), Err(CodecError::FrameTooLarge(_))));
    }
}
