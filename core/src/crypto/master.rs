// Master key transport payload
//
// The creator mints the long-term master key + salt exactly once per
// relationship. After transport both devices hold byte-identical copies and
// derive every local-data encryption key from them — which is why the pair
// is never regenerated once pairing completes.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::PairingError;

/// Master key length in bytes.
pub const MASTER_KEY_LEN: usize = 32;

/// KDF salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Generate the long-term master key. Creator only — a joiner generating
/// its own would permanently fork the two devices' encryption keys.
pub fn generate_master_key() -> Vec<u8> {
    let mut key = vec![0u8; MASTER_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Generate the KDF salt that travels alongside the master key. Creator only.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// A batch of essential records bundled into the pairing payload so the
/// joiner has something to show before its first full sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    /// Name of the record store these belong to.
    pub store: String,
    /// Opaque records, passed through to the importer unchanged.
    pub records: Vec<serde_json::Value>,
}

/// The payload the creator seals into `tunnel-key`.
///
/// Never hits the wire except wrapped under the tunnel's shared secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyPayload {
    /// Long-term master key, identical on both devices after transport.
    #[serde(with = "b64")]
    pub master_key: Vec<u8>,
    /// KDF salt paired with the master key.
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    /// Identity of the creator-side user.
    pub creator_id: String,
    /// Identity of the joiner-side user.
    pub joiner_id: String,
    /// Optional essential records for immediate resync.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RecordBatch>,
}

impl MasterKeyPayload {
    /// Mint a fresh payload on the creator side.
    pub fn generate(creator_id: &str, joiner_id: &str) -> Self {
        Self {
            master_key: generate_master_key(),
            salt: generate_salt(),
            creator_id: creator_id.to_string(),
            joiner_id: joiner_id.to_string(),
            records: Vec::new(),
        }
    }

    /// Attach essential records to ship alongside the keys.
    pub fn with_records(mut self, records: Vec<RecordBatch>) -> Self {
        self.records = records;
        self
    }

    /// Serialize for sealing into `tunnel-key`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PairingError> {
        serde_json::to_vec(self).map_err(|e| PairingError::Serialization(e.to_string()))
    }

    /// Parse a decrypted `tunnel-key` payload. Anything that does not match
    /// the payload shape is a protocol violation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PairingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PairingError::ProtocolViolation(format!("malformed key payload: {e}")))
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
