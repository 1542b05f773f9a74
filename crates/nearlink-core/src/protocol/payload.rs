//! Handshake payload types.
//!
//! Only two payload shapes ever travel over the characteristic, and they are
//! told apart purely by their total length:
//!
//! ```text
//! Address-only : [address: 2 or 8 bytes]
//! Params       : [session_id: 4 BE][session_key: 8][addr_len: 1][address: addr_len]
//! ```

use std::fmt;

use rand::Rng;

use crate::protocol::codec::ProtocolError;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Length of the opaque session key in bytes.
pub const SESSION_KEY_LEN: usize = 8;

/// Largest ranging address accepted anywhere in the protocol.
pub const MAX_ADDRESS_LEN: usize = 8;

/// Length of a short (16-bit) ranging address.
pub const SHORT_ADDRESS_LEN: usize = 2;

/// Length of an extended (64-bit) ranging address.
pub const EXTENDED_ADDRESS_LEN: usize = 8;

/// Fixed prefix of a params payload: session id (4) + session key (8) + addr_len (1).
pub const PARAMS_HEADER_LEN: usize = 4 + SESSION_KEY_LEN + 1;

/// Shortest valid params payload (one address byte).
pub const MIN_PARAMS_LEN: usize = PARAMS_HEADER_LEN + 1;

/// Longest valid params payload.
pub const MAX_PARAMS_LEN: usize = PARAMS_HEADER_LEN + MAX_ADDRESS_LEN;

// ── Ranging address ───────────────────────────────────────────────────────────

/// A ranging-engine address of 1 to 8 bytes.
///
/// The bytes are opaque to the handshake; only the length is validated.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RangingAddress(Vec<u8>);

impl RangingAddress {
    /// Creates an address, rejecting empty or over-long byte strings.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] if the length is outside `1..=8`.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_ADDRESS_LEN {
            return Err(ProtocolError::MalformedPayload(format!(
                "ranging address must be 1..={MAX_ADDRESS_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; an address holds at least one byte.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<&[u8]> for RangingAddress {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for RangingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RangingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RangingAddress({self})")
    }
}

// ── Session key ───────────────────────────────────────────────────────────────

/// The 8-byte session secret shared by Controller and Controlee.
///
/// `Debug` never prints the key material.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub const fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Draws a fresh key from `rng`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

// ── Session parameters ────────────────────────────────────────────────────────

/// Everything the ranging engine needs to join a session with one peer.
///
/// Every field is mandatory, so a value of this type is always complete; the
/// codec never hands out a partially parsed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParameters {
    pub session_id: u32,
    pub session_key: SessionKey,
    /// Ranging address of the *other* device, from the holder's point of view.
    pub peer_ranging_address: RangingAddress,
}

impl SessionParameters {
    /// Generates parameters for a new session with `peer_ranging_address`.
    ///
    /// The session id is a non-negative 31-bit value so it stays positive when
    /// read back as a signed integer by ranging stacks that expect one.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, peer_ranging_address: RangingAddress) -> Self {
        Self {
            session_id: rng.gen::<u32>() & 0x7FFF_FFFF,
            session_key: SessionKey::random(rng),
            peer_ranging_address,
        }
    }

    /// Returns the same session with a different peer address.
    ///
    /// The Controller keeps the Controlee's address for its own ranging
    /// engine, but sends its *own* address on the wire, because the receiver
    /// interprets the address field as "the sender's address".
    pub fn with_peer_address(&self, peer_ranging_address: RangingAddress) -> Self {
        Self {
            session_id: self.session_id,
            session_key: self.session_key,
            peer_ranging_address,
        }
    }
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// One decoded characteristic value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakePayload {
    /// A Controlee's ranging address, exposed for the Controller to read.
    Address(RangingAddress),
    /// Session parameters written by the Controller.
    Params(SessionParameters),
}

impl HandshakePayload {
    /// Short human-readable name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakePayload::Address(_) => "address-only",
            HandshakePayload::Params(_) => "params",
        }
    }
}
