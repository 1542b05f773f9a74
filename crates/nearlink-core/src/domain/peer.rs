//! Peer identity, beacon id, and role types.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque transport-level address of a remote device.
///
/// Unique for the lifetime of one handshake only.  Radios rotate these, so a
/// `PeerIdentity` must never be persisted or used to recognise a device
/// across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 32-bit id broadcast in the advertisement's service data.
///
/// Lets a scanner correlate a discovery event with the connection that
/// follows.  It is assigned once per local run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceBeaconId(pub u32);

impl DeviceBeaconId {
    /// Draws a fresh id from `rng`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    /// Service-data encoding: 4 bytes, big-endian.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for DeviceBeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Ranging role for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Initiates ranging and assigns the session parameters.
    Controller,
    /// Receives the session parameters and joins the session.
    Controlee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Controller => f.write_str("controller"),
            Role::Controlee => f.write_str("controlee"),
        }
    }
}

/// Which side opened a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// We called `connect` on the peer.
    Local,
    /// The peer connected to our exposed characteristic.
    Remote,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_peer_identity_display_matches_input() {
        let peer = PeerIdentity::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(peer.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(peer.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_beacon_id_service_data_is_big_endian() {
        let beacon = DeviceBeaconId(0x0102_0304);
        assert_eq!(beacon.to_be_bytes(), [1, 2, 3, 4]);
        assert_eq!(DeviceBeaconId::from_be_bytes([1, 2, 3, 4]), beacon);
    }

    #[test]
    fn test_beacon_id_display_is_padded_hex() {
        assert_eq!(DeviceBeaconId(0xAB).to_string(), "0x000000AB");
    }

    #[test]
    fn test_random_beacon_ids_differ_across_draws() {
        let mut rng = StdRng::seed_from_u64(11);
        let a = DeviceBeaconId::random(&mut rng);
        let b = DeviceBeaconId::random(&mut rng);
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_display_is_lowercase() {
        assert_eq!(Role::Controlee.to_string(), "controlee");
        assert_eq!(Role::Controller.to_string(), "controller");
    }
}
