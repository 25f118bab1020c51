// Tether Core — Pairing Spine
//
// Two devices, one spoken room code, and a relay that never learns anything
// worth knowing. Everything else in the app builds on the keys agreed here.

pub mod crypto;
pub mod restore;
pub mod room;
pub mod session;
pub mod signal;
pub mod tunnel;

use thiserror::Error;

pub use crypto::envelope::{open, seal, SealedEnvelope};
pub use crypto::exchange::{derive_shared_secret, EphemeralKeyPair, SharedSecret};
pub use crypto::master::{generate_master_key, generate_salt, MasterKeyPayload, RecordBatch};
pub use restore::{
    MemorySettings, RecordImporter, RestoreListener, RestoreOutcome, SettingsStore, SledSettings,
};
pub use room::{PairingRole, RoomCode, SessionIdentity};
pub use session::{PairingConfig, PairingSession};
pub use signal::{RelayChannel, RelayConnection, RendezvousServer};
pub use tunnel::{
    memory_link, run_creator_tunnel, run_joiner_tunnel, MemoryLink, TunnelLink, TunnelMessage,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Everything that can terminally end a pairing attempt.
///
/// None of these are retried inside a handshake. The caller decides whether
/// to start over — which means a fresh attempt with fresh ephemeral keys and
/// a fresh channel, never a resume.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("timed out waiting for the partner device to connect")]
    ConnectionTimeout,
    #[error("timed out waiting for a message from the partner device")]
    MessageTimeout,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("partner sent an invalid public key")]
    InvalidPeerKey,
    #[error("message authentication failed")]
    AuthenticationFailed,
    #[error("cannot pair a device with itself")]
    SelfPairingDetected,
    #[error("pairing payload is missing the partner identity")]
    MissingPartnerIdentity,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("settings storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("cryptographic failure: {0}")]
    Crypto(String),
}

// ============================================================================
// DELEGATE
// ============================================================================

/// Callback interface for pairing lifecycle events (UI notifications,
/// first-sync kicks). The app installs one implementation at startup.
pub trait PairingDelegate: Send + Sync {
    /// The device is now durably paired with `partner_id`.
    fn on_peer_connected(&self, partner_id: &str);
}
