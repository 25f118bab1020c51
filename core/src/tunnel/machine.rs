//! Role-specific tunnel state machines.
//!
//! Mirrored drivers, one per role, advancing one message at a time over a
//! single open link:
//!
//! Creator: `Idle → AwaitingJoinerInit → AwaitingJoinerId → Complete`
//! Joiner:  `Idle → AwaitingCreatorInit → AwaitingMasterKey → Complete`
//!
//! Any timeout, malformed message, or decryption failure is terminal for
//! the attempt. Retrying means a fresh handshake: fresh ephemeral keys,
//! fresh channel. Shared secrets and ephemeral keys drop on every exit
//! path, success or failure.

use std::time::Duration;

use super::messages::{decode_field, TunnelMessage};
use super::TunnelLink;
use crate::crypto::envelope::{open, seal, SealedEnvelope, NONCE_LEN};
use crate::crypto::exchange::{derive_shared_secret, EphemeralKeyPair};
use crate::crypto::master::MasterKeyPayload;
use crate::PairingError;

/// Default bound for each single-message wait inside the tunnel.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreatorState {
    Idle,
    AwaitingJoinerInit,
    AwaitingJoinerId,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinerState {
    Idle,
    AwaitingCreatorInit,
    AwaitingMasterKey,
    Complete,
}

/// Run the creator side of the tunnel over an open connection.
///
/// Resolves with the freshly minted [`MasterKeyPayload`] once the sealed
/// key has been sent to the joiner.
pub async fn run_creator_tunnel<L: TunnelLink>(
    link: &mut L,
    local_id: &str,
) -> Result<MasterKeyPayload, PairingError> {
    run_creator_tunnel_with(link, local_id, MESSAGE_TIMEOUT).await
}

/// Creator tunnel with an explicit per-message receive bound.
pub async fn run_creator_tunnel_with<L: TunnelLink>(
    link: &mut L,
    local_id: &str,
    receive_timeout: Duration,
) -> Result<MasterKeyPayload, PairingError> {
    let mut state = CreatorState::Idle;
    let result = drive_creator(link, local_id, receive_timeout, &mut state).await;
    match &result {
        Ok(payload) => tracing::info!(joiner = %payload.joiner_id, "creator tunnel complete"),
        Err(e) => tracing::warn!(?state, "creator tunnel failed: {}", e),
    }
    result
}

async fn drive_creator<L: TunnelLink>(
    link: &mut L,
    local_id: &str,
    receive_timeout: Duration,
    state: &mut CreatorState,
) -> Result<MasterKeyPayload, PairingError> {
    // Announce our ephemeral key.
    let local = EphemeralKeyPair::generate();
    link.send(&TunnelMessage::init(&local.public_bytes()).encode()?)
        .await;
    *state = CreatorState::AwaitingJoinerInit;
    tracing::debug!(?state, "sent tunnel-init");

    // The joiner's ephemeral key.
    let public_key = match TunnelMessage::decode(&link.receive_once(receive_timeout).await?)? {
        TunnelMessage::Init { public_key } => public_key,
        other => {
            return Err(PairingError::ProtocolViolation(format!(
                "expected tunnel-init, got {}",
                other.message_type()
            )))
        }
    };
    let remote_public = decode_field("publicKey", &public_key)?;
    let secret = derive_shared_secret(local, &remote_public)?;
    *state = CreatorState::AwaitingJoinerId;
    tracing::debug!(?state, "shared secret derived");

    // The joiner tells us who it is.
    let joiner_id = match TunnelMessage::decode(&link.receive_once(receive_timeout).await?)? {
        TunnelMessage::JoinerId { joiner_id } => joiner_id,
        other => {
            return Err(PairingError::ProtocolViolation(format!(
                "expected tunnel-id, got {}",
                other.message_type()
            )))
        }
    };
    if joiner_id.is_empty() {
        return Err(PairingError::ProtocolViolation(
            "empty joiner identity".to_string(),
        ));
    }
    if joiner_id == local_id {
        return Err(PairingError::SelfPairingDetected);
    }

    // Mint the long-term keys and ship them sealed.
    let payload = MasterKeyPayload::generate(local_id, &joiner_id);
    let sealed = seal(&payload.to_bytes()?, &secret)?;
    link.send(&TunnelMessage::key(&sealed.iv, &sealed.ciphertext).encode()?)
        .await;
    *state = CreatorState::Complete;
    Ok(payload)
}

/// Run the joiner side of the tunnel over an open connection.
///
/// Resolves with the creator's [`MasterKeyPayload`] once it has been
/// received, opened, and parsed.
pub async fn run_joiner_tunnel<L: TunnelLink>(
    link: &mut L,
    local_id: &str,
) -> Result<MasterKeyPayload, PairingError> {
    run_joiner_tunnel_with(link, local_id, MESSAGE_TIMEOUT).await
}

/// Joiner tunnel with an explicit per-message receive bound.
pub async fn run_joiner_tunnel_with<L: TunnelLink>(
    link: &mut L,
    local_id: &str,
    receive_timeout: Duration,
) -> Result<MasterKeyPayload, PairingError> {
    let mut state = JoinerState::Idle;
    let result = drive_joiner(link, local_id, receive_timeout, &mut state).await;
    match &result {
        Ok(payload) => tracing::info!(creator = %payload.creator_id, "joiner tunnel complete"),
        Err(e) => tracing::warn!(?state, "joiner tunnel failed: {}", e),
    }
    result
}

async fn drive_joiner<L: TunnelLink>(
    link: &mut L,
    local_id: &str,
    receive_timeout: Duration,
    state: &mut JoinerState,
) -> Result<MasterKeyPayload, PairingError> {
    let local = EphemeralKeyPair::generate();
    let local_public = local.public_bytes();
    *state = JoinerState::AwaitingCreatorInit;

    // The creator speaks first.
    let public_key = match TunnelMessage::decode(&link.receive_once(receive_timeout).await?)? {
        TunnelMessage::Init { public_key } => public_key,
        other => {
            return Err(PairingError::ProtocolViolation(format!(
                "expected tunnel-init, got {}",
                other.message_type()
            )))
        }
    };
    let remote_public = decode_field("publicKey", &public_key)?;
    let secret = derive_shared_secret(local, &remote_public)?;

    // Answer with our key and our identity, in that order.
    link.send(&TunnelMessage::init(&local_public).encode()?).await;
    link.send(&TunnelMessage::joiner_id(local_id).encode()?).await;
    *state = JoinerState::AwaitingMasterKey;
    tracing::debug!(?state, "sent tunnel-init and tunnel-id");

    // The sealed master key.
    let (iv, encrypted) = match TunnelMessage::decode(&link.receive_once(receive_timeout).await?)? {
        TunnelMessage::Key { iv, encrypted } => (iv, encrypted),
        other => {
            return Err(PairingError::ProtocolViolation(format!(
                "expected tunnel-key, got {}",
                other.message_type()
            )))
        }
    };
    let iv_bytes = decode_field("iv", &iv)?;
    let iv: [u8; NONCE_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
        PairingError::ProtocolViolation(format!("iv must be {NONCE_LEN} bytes"))
    })?;
    let ciphertext = decode_field("encrypted", &encrypted)?;

    let plaintext = open(&SealedEnvelope { iv, ciphertext }, &secret)?;
    let payload = MasterKeyPayload::from_bytes(&plaintext)?;
    if payload.master_key.is_empty() || payload.salt.is_empty() {
        return Err(PairingError::ProtocolViolation(
            "key payload missing master key material".to_string(),
        ));
    }
    if payload.creator_id == local_id {
        return Err(PairingError::SelfPairingDetected);
    }
    *state = JoinerState::Complete;
    Ok(payload)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::exchange::SharedSecret;
    use crate::crypto::master::{MASTER_KEY_LEN, SALT_LEN};
    use crate::tunnel::memory_link;

    #[tokio::test]
    async fn test_full_handshake_over_memory_link() {
        let (mut creator_link, mut joiner_link) = memory_link();

        let (creator_result, joiner_result) = tokio::join!(
            run_creator_tunnel(&mut creator_link, "creator-1"),
            run_joiner_tunnel(&mut joiner_link, "joiner-1"),
        );

        let creator_payload = creator_result.unwrap();
        let joiner_payload = joiner_result.unwrap();

        assert_eq!(creator_payload, joiner_payload);
        assert_eq!(creator_payload.creator_id, "creator-1");
        assert_eq!(creator_payload.joiner_id, "joiner-1");
        assert_eq!(creator_payload.master_key.len(), MASTER_KEY_LEN);
        assert_eq!(creator_payload.salt.len(), SALT_LEN);
    }

    #[tokio::test]
    async fn test_handshakes_mint_distinct_keys() {
        let (mut c1, mut j1) = memory_link();
        let (mut c2, mut j2) = memory_link();

        let (a, _) = tokio::join!(
            run_creator_tunnel(&mut c1, "creator-1"),
            run_joiner_tunnel(&mut j1, "joiner-1"),
        );
        let (b, _) = tokio::join!(
            run_creator_tunnel(&mut c2, "creator-1"),
            run_joiner_tunnel(&mut j2, "joiner-1"),
        );

        assert_ne!(a.unwrap().master_key, b.unwrap().master_key);
    }

    #[tokio::test]
    async fn test_creator_rejects_out_of_order_message() {
        let (mut creator_link, mut script) = memory_link();

        let creator = tokio::spawn(async move {
            let result = run_creator_tunnel(&mut creator_link, "creator-1").await;
            (creator_link, result)
        });

        // Swallow the creator's init, then answer with tunnel-id before
        // tunnel-init.
        let _init = script.receive_once(Duration::from_secs(1)).await.unwrap();
        script
            .send(&TunnelMessage::joiner_id("joiner-1").encode().unwrap())
            .await;

        let (_link, result) = creator.await.unwrap();
        assert!(matches!(result, Err(PairingError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_creator_rejects_invalid_peer_key() {
        let (mut creator_link, mut script) = memory_link();

        let creator = tokio::spawn(async move {
            run_creator_tunnel(&mut creator_link, "creator-1").await
        });

        let _init = script.receive_once(Duration::from_secs(1)).await.unwrap();
        // A low-order point: decodes fine, fails the agreement.
        script
            .send(&TunnelMessage::init(&[0u8; 32]).encode().unwrap())
            .await;

        let result = creator.await.unwrap();
        assert!(matches!(result, Err(PairingError::InvalidPeerKey)));
    }

    #[tokio::test]
    async fn test_creator_detects_self_pairing() {
        let (mut creator_link, mut joiner_link) = memory_link();

        // Both sides claim the same identity. The creator fails as soon as
        // the identity arrives; the joiner never gets a tunnel-key and runs
        // into its (shortened) receive bound.
        let (creator_result, _joiner_result) = tokio::join!(
            run_creator_tunnel_with(&mut creator_link, "same-user", Duration::from_secs(1)),
            run_joiner_tunnel_with(&mut joiner_link, "same-user", Duration::from_secs(1)),
        );

        assert!(matches!(
            creator_result,
            Err(PairingError::SelfPairingDetected)
        ));
    }

    #[tokio::test]
    async fn test_creator_times_out_on_silent_joiner() {
        let (mut creator_link, _joiner_link) = memory_link();

        let result =
            run_creator_tunnel_with(&mut creator_link, "creator-1", Duration::from_millis(100))
                .await;
        assert!(matches!(result, Err(PairingError::MessageTimeout)));
    }

    #[tokio::test]
    async fn test_joiner_times_out_on_silent_creator() {
        let (_creator_link, mut joiner_link) = memory_link();

        let result =
            run_joiner_tunnel_with(&mut joiner_link, "joiner-1", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(PairingError::MessageTimeout)));
    }

    #[tokio::test]
    async fn test_joiner_rejects_tampered_master_key() {
        let (mut joiner_link, mut script) = memory_link();

        let joiner = tokio::spawn(async move {
            run_joiner_tunnel(&mut joiner_link, "joiner-1").await
        });

        // Play the creator's part, but seal the payload under a key the
        // joiner cannot possibly derive.
        let creator_pair = EphemeralKeyPair::generate();
        script
            .send(&TunnelMessage::init(&creator_pair.public_bytes()).encode().unwrap())
            .await;
        let _joiner_init = script.receive_once(Duration::from_secs(1)).await.unwrap();
        let _joiner_id = script.receive_once(Duration::from_secs(1)).await.unwrap();

        let wrong_key = SharedSecret::from_bytes([0x42; 32]);
        let payload = MasterKeyPayload::generate("creator-1", "joiner-1");
        let sealed = seal(&payload.to_bytes().unwrap(), &wrong_key).unwrap();
        script
            .send(&TunnelMessage::key(&sealed.iv, &sealed.ciphertext).encode().unwrap())
            .await;

        let result = joiner.await.unwrap();
        assert!(matches!(result, Err(PairingError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_joiner_rejects_malformed_iv() {
        let (mut joiner_link, mut script) = memory_link();

        let joiner = tokio::spawn(async move {
            run_joiner_tunnel(&mut joiner_link, "joiner-1").await
        });

        let creator_pair = EphemeralKeyPair::generate();
        script
            .send(&TunnelMessage::init(&creator_pair.public_bytes()).encode().unwrap())
            .await;
        let _joiner_init = script.receive_once(Duration::from_secs(1)).await.unwrap();
        let _joiner_id = script.receive_once(Duration::from_secs(1)).await.unwrap();

        // 12-byte iv where 24 are required.
        script
            .send(&TunnelMessage::key(&[0u8; 12], &[1, 2, 3]).encode().unwrap())
            .await;

        let result = joiner.await.unwrap();
        assert!(matches!(result, Err(PairingError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_joiner_rejects_garbage_first_message() {
        let (mut joiner_link, mut script) = memory_link();

        let joiner = tokio::spawn(async move {
            run_joiner_tunnel(&mut joiner_link, "joiner-1").await
        });

        script.send(b"definitely not json").await;

        let result = joiner.await.unwrap();
        assert!(matches!(result, Err(PairingError::ProtocolViolation(_))));
    }
}
