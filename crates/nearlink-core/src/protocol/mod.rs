//! Protocol module containing the handshake payload types and the binary codec.

pub mod codec;
pub mod payload;

pub use codec::{decode_payload, encode_address, encode_params, encode_payload, ProtocolError};
pub use payload::*;
