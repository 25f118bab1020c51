// Sealed envelopes: XChaCha20-Poly1305 with a fresh random nonce per seal

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use super::exchange::SharedSecret;
use crate::PairingError;

/// Nonce length for XChaCha20-Poly1305. Carried on the wire as the `iv`
/// field of `tunnel-key`.
pub const NONCE_LEN: usize = 24;

/// One sealed payload: the nonce it was sealed under plus the ciphertext
/// (auth tag included). Safe to hand to an untrusted relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub iv: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Seal `plaintext` under `key` with a fresh random nonce.
///
/// A nonce is never reused under the same key: every call draws a new one,
/// and the key itself lives for a single pairing attempt.
pub fn seal(plaintext: &[u8], key: &SharedSecret) -> Result<SealedEnvelope, PairingError> {
    let mut iv = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| PairingError::Crypto(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&iv), plaintext)
        .map_err(|e| PairingError::Crypto(e.to_string()))?;

    Ok(SealedEnvelope { iv, ciphertext })
}

/// Open a sealed envelope.
///
/// A failed tag check means corruption in transit or a tampering relay.
/// Either way it is a hard protocol failure — the pairing attempt aborts,
/// it is never silently retried.
pub fn open(envelope: &SealedEnvelope, key: &SharedSecret) -> Result<Vec<u8>, PairingError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| PairingError::Crypto(e.to_string()))?;

    cipher
        .decrypt(XNonce::from_slice(&envelope.iv), envelope.ciphertext.as_slice())
        .map_err(|_| PairingError::AuthenticationFailed)
}
