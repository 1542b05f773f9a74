//! The ranging engine seen from the handshake.
//!
//! The handshake only hands over validated [`SessionParameters`] and passes
//! the resulting [`RangingUpdate`]s through untouched.

use async_trait::async_trait;
use nearlink_core::{PeerIdentity, RangingAddress, SessionParameters};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for ranging operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangingError {
    /// The ranging hardware is off or missing.
    #[error("ranging unavailable: {0}")]
    Unavailable(String),

    /// The engine refused the session parameters.
    #[error("ranging session rejected: {0}")]
    Rejected(String),
}

/// One measurement, or the end of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum RangingUpdate {
    Position {
        distance_m: f32,
        azimuth_deg: f32,
        elevation_deg: Option<f32>,
    },
    /// The engine lost the peer.
    PeerDisconnected,
}

/// Ranging capability consumed by the handshake service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RangingService: Send + Sync {
    /// Prepares the Controlee side and returns the address peers must use.
    async fn prepare_controlee(&self) -> Result<RangingAddress, RangingError>;

    /// Our address when acting as Controller.
    async fn controller_address(&self) -> Result<RangingAddress, RangingError>;

    async fn start_as_controller(
        &self,
        peer: &PeerIdentity,
        params: SessionParameters,
    ) -> Result<mpsc::Receiver<RangingUpdate>, RangingError>;

    async fn start_as_controlee(
        &self,
        peer: &PeerIdentity,
        params: SessionParameters,
    ) -> Result<mpsc::Receiver<RangingUpdate>, RangingError>;

    /// Ends the session with `peer`, if any.
    async fn stop(&self, peer: &PeerIdentity);
}
