// Ephemeral key agreement: X25519 ECDH + Blake3 KDF
//
// Each pairing attempt burns exactly one fresh X25519 keypair per side.
// The raw DH output never leaves this module; what comes out is a
// Blake3-derived symmetric key for the envelope cipher.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::PairingError;

/// KDF context string for deriving tunnel keys from ECDH shared secrets.
/// Changing this breaks pairing compatibility between app versions.
const KDF_CONTEXT: &str = "tether v1 pairing tunnel 2026-07-14";

/// Fresh X25519 keypair for a single pairing attempt.
///
/// The secret half is consumed by [`derive_shared_secret`] and cannot be
/// reused; only the public half ever goes on the wire.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a keypair from the OS random source.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half as raw bytes for the `tunnel-init` message.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

/// Symmetric key material both sides derive from the ephemeral exchange.
///
/// Wiped on drop. Lives exactly as long as the master-key transport step
/// that it wraps.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Derive the tunnel key from our ephemeral secret and the peer's public
/// key bytes.
///
/// Commutative: `derive(a, B.public) == derive(b, A.public)`, so either side
/// may compute it first. Consumes the local pair — X25519 ephemeral secrets
/// are single-use by construction.
pub fn derive_shared_secret(
    local: EphemeralKeyPair,
    remote_public: &[u8],
) -> Result<SharedSecret, PairingError> {
    let remote_bytes: [u8; 32] = remote_public
        .try_into()
        .map_err(|_| PairingError::InvalidPeerKey)?;
    let remote = PublicKey::from(remote_bytes);

    let dh = local.secret.diffie_hellman(&remote);
    // A low-order peer point collapses the DH output to a value the peer
    // controls. Reject it instead of deriving a key from it.
    if !dh.was_contributory() {
        return Err(PairingError::InvalidPeerKey);
    }

    Ok(SharedSecret(blake3::derive_key(KDF_CONTEXT, dh.as_bytes())))
}
