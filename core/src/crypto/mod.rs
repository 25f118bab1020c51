// Cryptography module — ephemeral key agreement, sealed envelopes, and the
// master key both devices end up sharing

pub mod envelope;
pub mod exchange;
pub mod master;

pub use envelope::{open, seal, SealedEnvelope};
pub use exchange::{derive_shared_secret, EphemeralKeyPair, SharedSecret};
pub use master::{generate_master_key, generate_salt, MasterKeyPayload, RecordBatch};
