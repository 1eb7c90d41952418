//! Codec for encoding/decoding tunnel messages

use thiserror::Error;

use crate::messages::TunnelMessage;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Tunnel message codec
///
/// Frames are UTF-8 JSON objects, one message per transport frame; the
/// underlying transport owns any byte-level framing.
pub struct MessageCodec;

impl MessageCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a tunnel message to a transport frame
    pub fn encode(msg: &TunnelMessage) -> Result<String, CodecError> {
        let encoded = serde_json::to_string(msg)?;

        if encoded.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(encoded.len()));
        }

        Ok(encoded)
    }

    /// Decode a tunnel message from a transport frame
    pub fn decode(raw: &str) -> Result<TunnelMessage, CodecError> {
        if raw.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(raw.len()));
        }

        Ok(serde_json::from_str(raw)?)
    }
}
