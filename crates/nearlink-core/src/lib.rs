//! # nearlink-core
//!
//! Shared library for NearLink containing the handshake wire codec and the
//! pure protocol logic that lets two devices with no prior relationship agree
//! on ranging roles and exchange session parameters.
//!
//! The crate has zero dependencies on OS APIs, radio stacks, or async
//! runtimes.  Radio events are fed in as plain values and the state machine
//! answers with the actions the caller must perform.
//!
//! # Architecture overview
//!
//! Two nearby devices both advertise a beacon and scan for each other.  The
//! first one to see the other becomes the **Controller**, connects, reads the
//! peer's ranging address, and writes back the session parameters.  The
//! device that was connected to becomes the **Controlee**, receives those
//! parameters, and joins the ranging session.
//!
//! - **`protocol`** – The two fixed-format payloads exchanged over the single
//!   characteristic (address-only and params), and the codec that converts
//!   them to and from bytes.
//!
//! - **`domain`** – Peer identities, the role arbitrator, the per-peer
//!   handshake state machine, and the session registry that guarantees at
//!   most one handshake per peer.

pub mod domain;
pub mod protocol;

pub use domain::arbitration::{Decision, IgnoreReason, RoleArbitrator, RolePreference};
pub use domain::handshake::{
    HandshakeAction, HandshakeContext, HandshakeInput, HandshakeState, StepOutcome,
    TerminationReason,
};
pub use domain::peer::{ConnectionOrigin, DeviceBeaconId, PeerIdentity, Role};
pub use domain::registry::{RegistryConfig, RegistryError, SessionRegistry};
pub use protocol::codec::{
    decode_payload, encode_address, encode_params, encode_payload, ProtocolError,
};
pub use protocol::payload::{HandshakePayload, RangingAddress, SessionKey, SessionParameters};
