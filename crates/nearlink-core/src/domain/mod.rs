//! Domain logic for the NearLink handshake.
//!
//! Everything in this module is synchronous and free of I/O.  Radio and
//! ranging events enter as plain values, and the state machine replies with
//! the actions the caller must carry out.  That keeps every transition
//! testable without a radio, an async runtime, or a clock.

/// Peer identities, beacon ids, roles.
pub mod peer;

/// Who becomes Controller and who becomes Controlee.
pub mod arbitration;

/// Per-peer handshake state machine.
///
/// See [`handshake::HandshakeContext::step`] for the transition table.
pub mod handshake;

/// At-most-one-handshake-per-peer bookkeeping.
pub mod registry;
