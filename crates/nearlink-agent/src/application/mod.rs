//! Application layer: the handshake service and the collaborator traits it
//! depends on.
//!
//! Nothing here touches a real radio or ranging chip.  Those arrive as
//! [`link::LinkTransport`] and [`ranging::RangingService`] implementations
//! injected at construction time.

pub mod handshake_service;
pub mod link;
mod peer_worker;
pub mod ranging;
