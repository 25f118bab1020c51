//! One pairing attempt, owned end to end.
//!
//! A session owns its relay channel and connection exclusively until the
//! attempt completes, fails, or is dropped, and releases both on every exit
//! path. Retrying means building a new session — fresh ephemeral keys,
//! fresh channel; there is nothing to resume.

use std::time::Duration;

use crate::crypto::master::MasterKeyPayload;
use crate::room::{PairingRole, RoomCode, SessionIdentity};
use crate::signal::transport::{RelayChannel, DIAL_TIMEOUT, LISTEN_TIMEOUT, SETUP_TIMEOUT};
use crate::tunnel::machine::{run_creator_tunnel_with, run_joiner_tunnel_with, MESSAGE_TIMEOUT};
use crate::PairingError;

/// Knobs for one pairing attempt. Defaults: 10 s relay setup, 120 s
/// creator listen, 30 s joiner dial, 30 s per message.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Relay address, `host:port`.
    pub relay_addr: String,
    pub setup_timeout: Duration,
    pub listen_timeout: Duration,
    pub dial_timeout: Duration,
    pub receive_timeout: Duration,
}

impl PairingConfig {
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            setup_timeout: SETUP_TIMEOUT,
            listen_timeout: LISTEN_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            receive_timeout: MESSAGE_TIMEOUT,
        }
    }
}

/// Orchestrates one pairing attempt for either role.
pub struct PairingSession {
    config: PairingConfig,
}

impl PairingSession {
    pub fn new(config: PairingConfig) -> Self {
        Self { config }
    }

    /// Creator side: claim the code-derived endpoint, wait for the joiner,
    /// run the creator tunnel, and hand the minted payload back for local
    /// finalization.
    pub async fn run_creator(
        &self,
        code: &RoomCode,
        local_id: &str,
    ) -> Result<MasterKeyPayload, PairingError> {
        let local = SessionIdentity::derive(code, PairingRole::Creator);
        tracing::info!(code = %code, "starting creator pairing attempt");

        let channel =
            RelayChannel::initialize(&self.config.relay_addr, &local, self.config.setup_timeout)
                .await?;
        let mut conn = channel.listen_for_peer(self.config.listen_timeout).await?;

        let result =
            run_creator_tunnel_with(&mut conn, local_id, self.config.receive_timeout).await;
        conn.close().await;
        result
    }

    /// Joiner side: claim our endpoint, dial the creator's, run the joiner
    /// tunnel, and hand the received payload back for local finalization.
    pub async fn run_joiner(
        &self,
        code: &RoomCode,
        local_id: &str,
    ) -> Result<MasterKeyPayload, PairingError> {
        let local = SessionIdentity::derive(code, PairingRole::Joiner);
        tracing::info!(code = %code, "starting joiner pairing attempt");

        let channel =
            RelayChannel::initialize(&self.config.relay_addr, &local, self.config.setup_timeout)
                .await?;
        let mut conn = channel
            .connect_to_peer(&local.remote(), self.config.dial_timeout)
            .await?;

        let result = run_joiner_tunnel_with(&mut conn, local_id, self.config.receive_timeout).await;
        conn.close().await;
        result
    }
}
