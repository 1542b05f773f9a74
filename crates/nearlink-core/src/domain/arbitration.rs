//! Role arbitration.
//!
//! Both devices advertise and scan at the same time.  The rule that breaks the
//! symmetry is local and per peer:
//!
//! - Seeing a peer's advertisement first makes us that peer's **Controller**.
//! - Being connected to by a peer we have not seen makes us its **Controlee**.
//!
//! When both sides see each other inside one scan window, both decide
//! "Controller".  The registry's uniqueness rule drops the second initiation
//! on each side and the handshake state machine settles the remaining
//! collision.
//!
//! A [`RolePreference`] other than `Auto` forces the role; the state machine
//! is unaware of it.

use serde::{Deserialize, Serialize};

use crate::domain::peer::{PeerIdentity, Role};
use crate::domain::registry::SessionRegistry;

/// Configured role override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolePreference {
    /// First observation wins.
    #[default]
    Auto,
    /// Never accept inbound handshakes.
    Controller,
    /// Never initiate a handshake.
    Controlee,
}

/// Why an event did not start a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// A live handshake with this peer already exists.
    AlreadyInProgress,
    /// The registry holds its maximum number of live handshakes.
    Busy,
    /// The configured preference pins us to this role.
    RoleForced(Role),
}

/// Outcome of arbitrating one discovery or inbound-connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Become(Role),
    Ignore(IgnoreReason),
}

/// Decides this device's role for each newly observed peer.
#[derive(Debug, Clone)]
pub struct RoleArbitrator {
    preference: RolePreference,
    suspend_advertising_as_controller: bool,
}

impl RoleArbitrator {
    pub fn new(preference: RolePreference) -> Self {
        Self {
            preference,
            suspend_advertising_as_controller: true,
        }
    }

    /// Sets whether advertising pauses once we lock in as Controller.
    pub fn with_advertising_suspension(mut self, suspend: bool) -> Self {
        self.suspend_advertising_as_controller = suspend;
        self
    }

    pub fn preference(&self) -> RolePreference {
        self.preference
    }

    /// We saw `peer` advertising.
    pub fn on_advertisement(&self, peer: &PeerIdentity, registry: &SessionRegistry) -> Decision {
        if self.preference == RolePreference::Controlee {
            return Decision::Ignore(IgnoreReason::RoleForced(Role::Controlee));
        }
        Self::arbitrate(peer, registry, Role::Controller)
    }

    /// `peer` connected to us.
    pub fn on_inbound_connection(
        &self,
        peer: &PeerIdentity,
        registry: &SessionRegistry,
    ) -> Decision {
        if self.preference == RolePreference::Controller {
            return Decision::Ignore(IgnoreReason::RoleForced(Role::Controller));
        }
        Self::arbitrate(peer, registry, Role::Controlee)
    }

    /// Advertising should stop once we are `role` for some peer.
    pub fn should_suspend_advertising(&self, role: Role) -> bool {
        role == Role::Controller && self.suspend_advertising_as_controller
    }

    /// Scanning should stop once we are `role` for some peer.
    ///
    /// A single-peer Controlee has nothing left to look for.
    pub fn should_stop_scanning(&self, role: Role, capacity: usize) -> bool {
        role == Role::Controlee && capacity == 1
    }

    fn arbitrate(peer: &PeerIdentity, registry: &SessionRegistry, role: Role) -> Decision {
        if registry.is_live(peer) {
            Decision::Ignore(IgnoreReason::AlreadyInProgress)
        } else if registry.is_full() {
            Decision::Ignore(IgnoreReason::Busy)
        } else {
            Decision::Become(role)
        }
    }
}

impl Default for RoleArbitrator {
    fn default() -> Self {
        Self::new(RolePreference::Auto)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::peer::DeviceBeaconId;
    use crate::domain::registry::RegistryConfig;

    fn registry(capacity: usize) -> SessionRegistry {
        SessionRegistry::new(RegistryConfig {
            capacity,
            connect_retries: 1,
            local_beacon: DeviceBeaconId(1),
        })
    }

    #[test]
    fn test_first_advertisement_makes_us_controller() {
        let arbitrator = RoleArbitrator::default();
        let registry = registry(1);
        let decision = arbitrator.on_advertisement(&PeerIdentity::from("peer-a"), &registry);
        assert_eq!(decision, Decision::Become(Role::Controller));
    }

    #[test]
    fn test_inbound_connection_makes_us_controlee() {
        let arbitrator = RoleArbitrator::default();
        let registry = registry(1);
        let decision = arbitrator.on_inbound_connection(&PeerIdentity::from("peer-a"), &registry);
        assert_eq!(decision, Decision::Become(Role::Controlee));
    }

    #[test]
    fn test_live_handshake_with_same_peer_is_already_in_progress() {
        let arbitrator = RoleArbitrator::default();
        let mut registry = registry(1);
        let peer = PeerIdentity::from("peer-a");
        registry.begin(peer.clone()).unwrap();

        assert_eq!(
            arbitrator.on_advertisement(&peer, &registry),
            Decision::Ignore(IgnoreReason::AlreadyInProgress)
        );
        assert_eq!(
            arbitrator.on_inbound_connection(&peer, &registry),
            Decision::Ignore(IgnoreReason::AlreadyInProgress)
        );
    }

    #[test]
    fn test_full_registry_makes_other_peers_busy() {
        let arbitrator = RoleArbitrator::default();
        let mut registry = registry(1);
        registry.begin(PeerIdentity::from("peer-a")).unwrap();

        let decision = arbitrator.on_advertisement(&PeerIdentity::from("peer-b"), &registry);
        assert_eq!(decision, Decision::Ignore(IgnoreReason::Busy));
    }

    #[test]
    fn test_forced_controlee_ignores_advertisements() {
        let arbitrator = RoleArbitrator::new(RolePreference::Controlee);
        let registry = registry(1);
        let peer = PeerIdentity::from("peer-a");

        assert_eq!(
            arbitrator.on_advertisement(&peer, &registry),
            Decision::Ignore(IgnoreReason::RoleForced(Role::Controlee))
        );
        assert_eq!(
            arbitrator.on_inbound_connection(&peer, &registry),
            Decision::Become(Role::Controlee)
        );
    }

    #[test]
    fn test_forced_controller_ignores_inbound_connections() {
        let arbitrator = RoleArbitrator::new(RolePreference::Controller);
        let registry = registry(1);
        let peer = PeerIdentity::from("peer-a");

        assert_eq!(
            arbitrator.on_inbound_connection(&peer, &registry),
            Decision::Ignore(IgnoreReason::RoleForced(Role::Controller))
        );
        assert_eq!(
            arbitrator.on_advertisement(&peer, &registry),
            Decision::Become(Role::Controller)
        );
    }

    #[test]
    fn test_advertising_suspends_only_for_controller() {
        let arbitrator = RoleArbitrator::default();
        assert!(arbitrator.should_suspend_advertising(Role::Controller));
        assert!(!arbitrator.should_suspend_advertising(Role::Controlee));

        let keep_advertising = RoleArbitrator::default().with_advertising_suspension(false);
        assert!(!keep_advertising.should_suspend_advertising(Role::Controller));
    }

    #[test]
    fn test_scanning_stops_for_single_peer_controlee() {
        let arbitrator = RoleArbitrator::default();
        assert!(arbitrator.should_stop_scanning(Role::Controlee, 1));
        assert!(!arbitrator.should_stop_scanning(Role::Controlee, 2));
        assert!(!arbitrator.should_stop_scanning(Role::Controller, 1));
    }
}
