//! Tunnel wire messages — the closed set of shapes allowed on the channel.
//!
//! Anything that does not decode to one of these three is rejected at the
//! boundary as a protocol violation; the state machines never see it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::PairingError;

/// Everything that may legally cross the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TunnelMessage {
    /// Ephemeral public key announcement. Each role sends exactly one.
    #[serde(rename = "tunnel-init")]
    Init {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    /// Joiner identity announcement, joiner → creator only.
    #[serde(rename = "tunnel-id")]
    JoinerId {
        #[serde(rename = "joinerId")]
        joiner_id: String,
    },
    /// Sealed master-key payload, creator → joiner only. Valid only after
    /// both sides have exchanged `tunnel-init`.
    #[serde(rename = "tunnel-key")]
    Key { iv: String, encrypted: String },
}

impl TunnelMessage {
    /// Build an init message from raw public key bytes.
    pub fn init(public_key: &[u8]) -> Self {
        TunnelMessage::Init {
            public_key: BASE64.encode(public_key),
        }
    }

    /// Build the joiner identity announcement.
    pub fn joiner_id(id: &str) -> Self {
        TunnelMessage::JoinerId {
            joiner_id: id.to_string(),
        }
    }

    /// Build the sealed master-key message.
    pub fn key(iv: &[u8], encrypted: &[u8]) -> Self {
        TunnelMessage::Key {
            iv: BASE64.encode(iv),
            encrypted: BASE64.encode(encrypted),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            TunnelMessage::Init { .. } => "tunnel-init",
            TunnelMessage::JoinerId { .. } => "tunnel-id",
            TunnelMessage::Key { .. } => "tunnel-key",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PairingError> {
        serde_json::to_vec(self).map_err(|e| PairingError::Serialization(e.to_string()))
    }

    /// Schema-checked decode at the channel boundary.
    pub fn decode(bytes: &[u8]) -> Result<Self, PairingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PairingError::ProtocolViolation(format!("unrecognized tunnel message: {e}")))
    }
}

/// Decode a base64 wire field, mapping failure to a protocol violation.
pub fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, PairingError> {
    BASE64
        .decode(value)
        .map_err(|_| PairingError::ProtocolViolation(format!("field {name} is not valid base64")))
}
