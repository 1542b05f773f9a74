//! The short-range link the handshake runs over.
//!
//! [`LinkTransport`] is the whole surface the handshake needs from a radio:
//! advertise and scan, connect, read and write one opaque characteristic,
//! and an event stream for link state and inbound writes.

use async_trait::async_trait;
use nearlink_core::{ConnectionOrigin, DeviceBeaconId, PeerIdentity};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for link operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is out of range or unknown to the radio.
    #[error("peer {0} is unreachable")]
    Unreachable(PeerIdentity),

    /// The operation needs an established link to the peer.
    #[error("no link to peer {0}")]
    NotConnected(PeerIdentity),

    /// The radio rejected or failed the operation.
    #[error("link operation failed: {0}")]
    Operation(String),
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub peer: PeerIdentity,
    pub beacon: DeviceBeaconId,
}

/// Asynchronous link events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected {
        peer: PeerIdentity,
        origin: ConnectionOrigin,
    },
    Disconnected {
        peer: PeerIdentity,
    },
    /// The peer wrote `bytes` to our characteristic.
    WriteReceived {
        peer: PeerIdentity,
        bytes: Vec<u8>,
    },
}

impl LinkEvent {
    pub fn peer(&self) -> &PeerIdentity {
        match self {
            LinkEvent::Connected { peer, .. }
            | LinkEvent::Disconnected { peer }
            | LinkEvent::WriteReceived { peer, .. } => peer,
        }
    }
}

/// Radio capability consumed by the handshake service.
///
/// Infrastructure implementations wrap a platform radio stack; tests use
/// [`LoopbackRadio`](crate::infrastructure::loopback::LoopbackRadio).
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Sets the value peers read from our characteristic.
    async fn expose_address(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Starts broadcasting `beacon` in the advertisement's service data.
    async fn advertise(&self, beacon: DeviceBeaconId) -> Result<(), TransportError>;

    async fn stop_advertise(&self);

    /// Starts scanning.  The stream ends when scanning stops.
    async fn scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError>;

    async fn stop_scan(&self);

    /// Requests a link to `peer`.
    ///
    /// `Ok` means the request was accepted.  Link establishment is reported
    /// later as [`LinkEvent::Connected`].
    async fn connect(&self, peer: &PeerIdentity) -> Result<(), TransportError>;

    /// Reads the peer's characteristic.
    async fn read_address(&self, peer: &PeerIdentity) -> Result<Vec<u8>, TransportError>;

    /// Writes `payload` to the peer's characteristic and waits for the
    /// write confirmation.
    async fn write_params(&self, peer: &PeerIdentity, payload: Vec<u8>)
        -> Result<(), TransportError>;

    async fn disconnect(&self, peer: &PeerIdentity);

    /// Opens the link event stream.
    async fn subscribe(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError>;
}
