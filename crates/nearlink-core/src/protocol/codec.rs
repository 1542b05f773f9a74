//! Binary codec for the two handshake payloads.
//!
//! Wire format:
//! ```text
//! Address-only : [address:2|8]
//! Params       : [session_id:4][session_key:8][addr_len:1][address:addr_len]
//! ```
//! Payloads carry no type tag; the total length alone selects the shape.
//! Lengths 2 and 8 are address-only, lengths 14..=21 are params, and every
//! other length is malformed.  Multi-byte integers are big-endian.
//!
//! This module is the single authority for the byte layout.  Reordering or
//! resizing any field is a protocol break.

use thiserror::Error;

use crate::protocol::payload::{
    HandshakePayload, RangingAddress, SessionKey, SessionParameters, EXTENDED_ADDRESS_LEN,
    MAX_ADDRESS_LEN, MIN_PARAMS_LEN, PARAMS_HEADER_LEN, SESSION_KEY_LEN, SHORT_ADDRESS_LEN,
};

/// Errors that can occur during payload encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The bytes do not form either payload shape (length or field mismatch).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// An address-only payload must be 2 or 8 bytes long to be decodable.
    #[error("a {len}-byte address cannot be sent as an address-only payload")]
    UnencodableAddress { len: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`HandshakePayload`] into its exact wire bytes (no padding).
///
/// # Errors
///
/// Returns [`ProtocolError::UnencodableAddress`] for an address-only payload
/// whose address is neither 2 nor 8 bytes.
///
/// # Examples
///
/// ```rust
/// use nearlink_core::protocol::{decode_payload, encode_payload, HandshakePayload, RangingAddress};
///
/// let payload = HandshakePayload::Address(RangingAddress::new(vec![0x12, 0x34]).unwrap());
/// let bytes = encode_payload(&payload).unwrap();
/// assert_eq!(bytes, vec![0x12, 0x34]);
/// assert_eq!(decode_payload(&bytes).unwrap(), payload);
/// ```
pub fn encode_payload(payload: &HandshakePayload) -> Result<Vec<u8>, ProtocolError> {
    match payload {
        HandshakePayload::Address(address) => encode_address(address),
        HandshakePayload::Params(params) => Ok(encode_params(params)),
    }
}

/// Encodes an address-only payload.
///
/// # Errors
///
/// Returns [`ProtocolError::UnencodableAddress`] unless the address is 2 or 8 bytes.
pub fn encode_address(address: &RangingAddress) -> Result<Vec<u8>, ProtocolError> {
    if !is_address_only_len(address.len()) {
        return Err(ProtocolError::UnencodableAddress { len: address.len() });
    }
    Ok(address.as_bytes().to_vec())
}

/// Encodes a params payload.
///
/// The address field carries `params.peer_ranging_address`, so the receiver
/// decodes exactly the parameters it should hand to its ranging engine.
///
/// # Examples
///
/// ```rust
/// use nearlink_core::protocol::{encode_params, RangingAddress, SessionKey, SessionParameters};
///
/// let params = SessionParameters {
///     session_id: 42,
///     session_key: SessionKey::from_bytes([0; 8]),
///     peer_ranging_address: RangingAddress::new(vec![0xAB]).unwrap(),
/// };
/// assert_eq!(
///     encode_params(&params),
///     vec![0, 0, 0, 0x2A, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xAB]
/// );
/// ```
pub fn encode_params(params: &SessionParameters) -> Vec<u8> {
    let address = params.peer_ranging_address.as_bytes();
    let mut buf = Vec::with_capacity(PARAMS_HEADER_LEN + address.len());

    buf.extend_from_slice(&params.session_id.to_be_bytes());
    buf.extend_from_slice(params.session_key.as_bytes());
    // RangingAddress guarantees 1..=8 bytes, so the length always fits a u8.
    buf.push(address.len() as u8);
    buf.extend_from_slice(address);
    buf
}

/// Decodes one characteristic value.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the length matches neither
/// shape, if `addr_len` disagrees with the bytes that follow it, or if
/// `addr_len` is 0 or greater than 8.
pub fn decode_payload(bytes: &[u8]) -> Result<HandshakePayload, ProtocolError> {
    match bytes.len() {
        len if is_address_only_len(len) => {
            RangingAddress::new(bytes).map(HandshakePayload::Address)
        }
        len if len >= MIN_PARAMS_LEN => decode_params(bytes).map(HandshakePayload::Params),
        len => Err(ProtocolError::MalformedPayload(format!(
            "length {len} matches neither an address-only payload \
             ({SHORT_ADDRESS_LEN} or {EXTENDED_ADDRESS_LEN} bytes) nor a params payload \
             (at least {MIN_PARAMS_LEN} bytes)"
        ))),
    }
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_params(p: &[u8]) -> Result<SessionParameters, ProtocolError> {
    require_len(p, MIN_PARAMS_LEN, "Params")?;

    let session_id = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);

    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&p[4..4 + SESSION_KEY_LEN]);

    let addr_len = p[PARAMS_HEADER_LEN - 1] as usize;
    if addr_len == 0 || addr_len > MAX_ADDRESS_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "Params: addr_len must be 1..={MAX_ADDRESS_LEN}, got {addr_len}"
        )));
    }

    let remaining = p.len() - PARAMS_HEADER_LEN;
    if addr_len != remaining {
        return Err(ProtocolError::MalformedPayload(format!(
            "Params: addr_len is {addr_len} but {remaining} address bytes follow"
        )));
    }

    Ok(SessionParameters {
        session_id,
        session_key: SessionKey::from_bytes(key),
        peer_ranging_address: RangingAddress::new(&p[PARAMS_HEADER_LEN..])?,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn is_address_only_len(len: usize) -> bool {
    len == SHORT_ADDRESS_LEN || len == EXTENDED_ADDRESS_LEN
}

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
