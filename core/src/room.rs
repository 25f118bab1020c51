//! Room codes and relay session identities.
//!
//! A room code is the only thing the two humans share out of band — read
//! aloud, typed, or pasted. Everything the transport needs (the relay
//! endpoint names for both roles) derives deterministically from the code,
//! offline, with no server round-trip.

use std::fmt;

use rand::Rng;

/// Characters a room code may contain. Visually ambiguous ones
/// (`I`, `L`, `O`, `0`, `1`) are excluded so codes survive being read
/// aloud or copied by hand.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Normalized room code length.
pub const CODE_LEN: usize = 8;

/// Prefix for relay endpoint names derived from a room code. The full name
/// must stay short enough for the relay's endpoint-naming rules.
const ENDPOINT_NAMESPACE: &str = "tether";

/// Uppercase, strip everything outside the alphabet, truncate to length.
pub fn normalize(input: &str) -> String {
    input
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii() && CODE_ALPHABET.contains(&(*c as u8)))
        .take(CODE_LEN)
        .collect()
}

/// True iff `input` normalizes to a full-length room code.
pub fn is_valid(input: &str) -> bool {
    normalize(input).len() == CODE_LEN
}

/// An 8-character human-shareable room code, stored normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomCode(String);

impl RoomCode {
    /// Draw a fresh code from the OS random source.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input, accepting any formatting the normalizer can repair
    /// (`ab cd-2345`, `ABCD2345`, `abcd-2345`, ...).
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = normalize(input);
        if normalized.len() == CODE_LEN {
            Some(Self(normalized))
        } else {
            None
        }
    }

    /// The normalized 8-character form, no separator.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    /// Renders as two 4-character groups: `XXXX-XXXX`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", &self.0[..4], &self.0[4..])
    }
}

/// Which side of the pairing this device is. Fixed by which entry path the
/// user took (create vs. join); never symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    /// Generates the master key and waits for the joiner.
    Creator,
    /// Dials the creator and receives the master key.
    Joiner,
}

impl PairingRole {
    /// Single-character role marker used in endpoint names.
    pub fn marker(self) -> char {
        match self {
            PairingRole::Creator => 'c',
            PairingRole::Joiner => 'j',
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            PairingRole::Creator => PairingRole::Joiner,
            PairingRole::Joiner => PairingRole::Creator,
        }
    }
}

impl fmt::Display for PairingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingRole::Creator => write!(f, "creator"),
            PairingRole::Joiner => write!(f, "joiner"),
        }
    }
}

/// Relay endpoint identity for one role of one pairing attempt.
///
/// Computed fresh per attempt and never persisted. Two devices holding the
/// same room code and opposite roles derive complementary identities and
/// find each other through the relay with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    code: RoomCode,
    role: PairingRole,
    endpoint: String,
}

impl SessionIdentity {
    /// Derive the endpoint identity for `role` in the room `code`.
    pub fn derive(code: &RoomCode, role: PairingRole) -> Self {
        let endpoint = format!(
            "{}-{}-{}",
            ENDPOINT_NAMESPACE,
            code.as_str().to_ascii_lowercase(),
            role.marker()
        );
        Self {
            code: code.clone(),
            role,
            endpoint,
        }
    }

    /// The complementary identity: same room, opposite role.
    pub fn remote(&self) -> Self {
        Self::derive(&self.code, self.role.opposite())
    }

    /// The relay endpoint name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn role(&self) -> PairingRole {
        self.role
    }
}

// ============================================================================
// TESTS
// ============================================================================
