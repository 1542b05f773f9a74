//! In-process radio shared by several simulated devices.
//!
//! [`LoopbackRadio`] is the air between devices: every [`LoopbackLink`]
//! attached to the same radio can see the others' advertisements, open links
//! to them, read their exposed characteristic and write to it.  Nothing
//! leaves the process, so the demo binary and the integration tests run two
//! or more devices side by side.
//!
//! # Fault injection
//!
//! - [`LoopbackRadio::drop_connects`] accepts connect requests to a device
//!   but never establishes the link, so the caller's connect timer fires.
//! - [`LoopbackRadio::fail_connects`] makes the next `n` connect requests
//!   to a device fail outright.
//! - [`LoopbackRadio::drop_link`] tears down an established link and reports
//!   the disconnect to both ends.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nearlink_core::{ConnectionOrigin, DeviceBeaconId, PeerIdentity};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::application::link::{Advertisement, LinkEvent, LinkTransport, TransportError};

const CHANNEL_CAPACITY: usize = 256;

/// Unordered pair of devices with a link between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LinkKey(PeerIdentity, PeerIdentity);

impl LinkKey {
    fn new(a: &PeerIdentity, b: &PeerIdentity) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }
}

#[derive(Default)]
struct DeviceSlot {
    exposed: Option<Vec<u8>>,
    advertising: Option<DeviceBeaconId>,
    scanner: Option<mpsc::Sender<Advertisement>>,
    events: Option<mpsc::Sender<LinkEvent>>,
}

impl DeviceSlot {
    fn notify(&self, event: LinkEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                warn!(error = %e, "loopback link event dropped");
            }
        }
    }

    fn offer(&self, advert: Advertisement) {
        if let Some(tx) = &self.scanner {
            if let Err(e) = tx.try_send(advert) {
                debug!(error = %e, "loopback advertisement dropped");
            }
        }
    }
}

#[derive(Default)]
struct RadioState {
    devices: HashMap<PeerIdentity, DeviceSlot>,
    links: HashSet<LinkKey>,
    dropped_connects: HashSet<PeerIdentity>,
    failing_connects: HashMap<PeerIdentity, u32>,
}

impl RadioState {
    fn notify(&self, device: &PeerIdentity, event: LinkEvent) {
        if let Some(slot) = self.devices.get(device) {
            slot.notify(event);
        }
    }

    fn require_link(&self, a: &PeerIdentity, b: &PeerIdentity) -> Result<(), TransportError> {
        if self.links.contains(&LinkKey::new(a, b)) {
            Ok(())
        } else {
            Err(TransportError::NotConnected(b.clone()))
        }
    }

    fn tear_down(&mut self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        if !self.links.remove(&LinkKey::new(a, b)) {
            return false;
        }
        self.notify(a, LinkEvent::Disconnected { peer: b.clone() });
        self.notify(b, LinkEvent::Disconnected { peer: a.clone() });
        true
    }
}

/// Shared medium for [`LoopbackLink`]s.  Clones share the same medium.
#[derive(Clone, Default)]
pub struct LoopbackRadio {
    state: Arc<Mutex<RadioState>>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device named `id` and returns its transport.
    pub fn attach(&self, id: impl Into<PeerIdentity>) -> LoopbackLink {
        let id = id.into();
        self.lock().devices.entry(id.clone()).or_default();
        LoopbackLink {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Connect requests to `target` are accepted but never complete.
    pub fn drop_connects(&self, target: impl Into<PeerIdentity>) {
        self.lock().dropped_connects.insert(target.into());
    }

    /// The next `count` connect requests to `target` fail.
    pub fn fail_connects(&self, target: impl Into<PeerIdentity>, count: u32) {
        self.lock().failing_connects.insert(target.into(), count);
    }

    /// Breaks the link between `a` and `b`, as if they moved out of range.
    ///
    /// Returns `false` if there was no link.
    pub fn drop_link(&self, a: impl Into<PeerIdentity>, b: impl Into<PeerIdentity>) -> bool {
        self.lock().tear_down(&a.into(), &b.into())
    }

    /// `true` if `a` and `b` are linked.
    pub fn is_linked(&self, a: impl Into<PeerIdentity>, b: impl Into<PeerIdentity>) -> bool {
        self.lock().links.contains(&LinkKey::new(&a.into(), &b.into()))
    }

    /// `true` if `device` is currently advertising.
    pub fn is_advertising(&self, device: impl Into<PeerIdentity>) -> bool {
        self.lock()
            .devices
            .get(&device.into())
            .is_some_and(|slot| slot.advertising.is_some())
    }

    /// `true` if `device` is currently scanning.
    pub fn is_scanning(&self, device: impl Into<PeerIdentity>) -> bool {
        self.lock()
            .devices
            .get(&device.into())
            .is_some_and(|slot| slot.scanner.is_some())
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One device's view of a [`LoopbackRadio`].
pub struct LoopbackLink {
    id: PeerIdentity,
    state: Arc<Mutex<RadioState>>,
}

impl LoopbackLink {
    pub fn id(&self) -> &PeerIdentity {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_slot<T>(&self, f: impl FnOnce(&mut DeviceSlot) -> T) -> T {
        let mut state = self.lock();
        f(state.devices.entry(self.id.clone()).or_default())
    }
}

#[async_trait]
impl LinkTransport for LoopbackLink {
    async fn expose_address(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.with_slot(|slot| slot.exposed = Some(payload));
        Ok(())
    }

    async fn advertise(&self, beacon: DeviceBeaconId) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.devices.entry(self.id.clone()).or_default().advertising = Some(beacon);
        for (id, slot) in &state.devices {
            if *id != self.id {
                slot.offer(Advertisement {
                    peer: self.id.clone(),
                    beacon,
                });
            }
        }
        debug!(device = %self.id, %beacon, "advertising");
        Ok(())
    }

    async fn stop_advertise(&self) {
        self.with_slot(|slot| slot.advertising = None);
    }

    async fn scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = self.lock();
        for (id, slot) in &state.devices {
            if *id == self.id {
                continue;
            }
            if let Some(beacon) = slot.advertising {
                let _ = tx.try_send(Advertisement {
                    peer: id.clone(),
                    beacon,
                });
            }
        }
        state.devices.entry(self.id.clone()).or_default().scanner = Some(tx);
        debug!(device = %self.id, "scanning");
        Ok(rx)
    }

    async fn stop_scan(&self) {
        self.with_slot(|slot| slot.scanner = None);
    }

    async fn connect(&self, peer: &PeerIdentity) -> Result<(), TransportError> {
        let mut state = self.lock();
        if *peer == self.id || !state.devices.contains_key(peer) {
            return Err(TransportError::Unreachable(peer.clone()));
        }
        if let Some(remaining) = state.failing_connects.get_mut(peer) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Operation(format!(
                    "connect to {peer} refused"
                )));
            }
        }
        if state.dropped_connects.contains(peer) {
            debug!(device = %self.id, %peer, "connect request swallowed");
            return Ok(());
        }

        let local = LinkEvent::Connected {
            peer: peer.clone(),
            origin: ConnectionOrigin::Local,
        };
        if state.links.insert(LinkKey::new(&self.id, peer)) {
            state.notify(&self.id, local);
            state.notify(
                peer,
                LinkEvent::Connected {
                    peer: self.id.clone(),
                    origin: ConnectionOrigin::Remote,
                },
            );
        } else {
            // The peer already opened this link; only our side learns of it.
            state.notify(&self.id, local);
        }
        Ok(())
    }

    async fn read_address(&self, peer: &PeerIdentity) -> Result<Vec<u8>, TransportError> {
        let state = self.lock();
        state.require_link(&self.id, peer)?;
        state
            .devices
            .get(peer)
            .and_then(|slot| slot.exposed.clone())
            .ok_or_else(|| TransportError::Operation(format!("{peer} exposes no address")))
    }

    async fn write_params(
        &self,
        peer: &PeerIdentity,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let state = self.lock();
        state.require_link(&self.id, peer)?;
        state.notify(
            peer,
            LinkEvent::WriteReceived {
                peer: self.id.clone(),
                bytes: payload,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerIdentity) {
        if self.lock().tear_down(&self.id, peer) {
            debug!(device = %self.id, %peer, "link closed");
        }
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.with_slot(|slot| slot.events = Some(tx));
        Ok(rx)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> PeerIdentity {
        PeerIdentity::from(name)
    }

    #[tokio::test]
    async fn test_scan_sees_existing_and_later_advertisers() {
        // Arrange
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        let b = radio.attach("b");
        let c = radio.attach("c");
        a.advertise(DeviceBeaconId(1)).await.unwrap();

        // Act
        let mut adverts = b.scan().await.unwrap();
        c.advertise(DeviceBeaconId(3)).await.unwrap();

        // Assert
        assert_eq!(
            adverts.recv().await,
            Some(Advertisement { peer: id("a"), beacon: DeviceBeaconId(1) })
        );
        assert_eq!(
            adverts.recv().await,
            Some(Advertisement { peer: id("c"), beacon: DeviceBeaconId(3) })
        );
    }

    #[tokio::test]
    async fn test_device_does_not_see_its_own_advertisement() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        let mut adverts = a.scan().await.unwrap();

        a.advertise(DeviceBeaconId(1)).await.unwrap();

        assert!(adverts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_scan_ends_the_stream() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        let mut adverts = a.scan().await.unwrap();

        a.stop_scan().await;

        assert_eq!(adverts.recv().await, None);
        assert!(!radio.is_scanning("a"));
    }

    #[tokio::test]
    async fn test_connect_reports_local_and_remote_sides() {
        // Arrange
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        let b = radio.attach("b");
        let mut a_events = a.subscribe().await.unwrap();
        let mut b_events = b.subscribe().await.unwrap();

        // Act
        a.connect(&id("b")).await.unwrap();

        // Assert
        assert_eq!(
            a_events.recv().await,
            Some(LinkEvent::Connected { peer: id("b"), origin: ConnectionOrigin::Local })
        );
        assert_eq!(
            b_events.recv().await,
            Some(LinkEvent::Connected { peer: id("a"), origin: ConnectionOrigin::Remote })
        );
        assert!(radio.is_linked("b", "a"));
    }

    #[tokio::test]
    async fn test_connect_over_existing_link_is_local_only() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        let b = radio.attach("b");
        let mut a_events = a.subscribe().await.unwrap();
        b.connect(&id("a")).await.unwrap();
        let _ = a_events.recv().await;

        a.connect(&id("b")).await.unwrap();
        b.disconnect(&id("a")).await;

        assert_eq!(
            a_events.recv().await,
            Some(LinkEvent::Connected { peer: id("b"), origin: ConnectionOrigin::Local })
        );
        assert_eq!(a_events.recv().await, Some(LinkEvent::Disconnected { peer: id("b") }));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer_is_unreachable() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");

        assert_eq!(
            a.connect(&id("ghost")).await,
            Err(TransportError::Unreachable(id("ghost")))
        );
        assert_eq!(a.connect(&id("a")).await, Err(TransportError::Unreachable(id("a"))));
    }

    #[tokio::test]
    async fn test_fail_connects_fails_the_next_n_attempts() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        radio.attach("b");
        radio.fail_connects("b", 2);

        assert!(matches!(a.connect(&id("b")).await, Err(TransportError::Operation(_))));
        assert!(matches!(a.connect(&id("b")).await, Err(TransportError::Operation(_))));
        assert!(a.connect(&id("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_connect_never_links() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        radio.attach("b");
        let mut events = a.subscribe().await.unwrap();
        radio.drop_connects("b");

        assert!(a.connect(&id("b")).await.is_ok());

        assert!(events.try_recv().is_err());
        assert!(!radio.is_linked("a", "b"));
    }

    #[tokio::test]
    async fn test_read_and_write_need_a_link() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        let b = radio.attach("b");
        b.expose_address(vec![0x12, 0x34]).await.unwrap();

        assert_eq!(
            a.read_address(&id("b")).await,
            Err(TransportError::NotConnected(id("b")))
        );
        assert_eq!(
            a.write_params(&id("b"), vec![1]).await,
            Err(TransportError::NotConnected(id("b")))
        );

        a.connect(&id("b")).await.unwrap();
        assert_eq!(a.read_address(&id("b")).await, Ok(vec![0x12, 0x34]));
    }

    #[tokio::test]
    async fn test_write_is_delivered_to_peer() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        let b = radio.attach("b");
        let mut b_events = b.subscribe().await.unwrap();
        a.connect(&id("b")).await.unwrap();
        let _ = b_events.recv().await;

        a.write_params(&id("b"), vec![9; 14]).await.unwrap();

        assert_eq!(
            b_events.recv().await,
            Some(LinkEvent::WriteReceived { peer: id("a"), bytes: vec![9; 14] })
        );
    }

    #[tokio::test]
    async fn test_drop_link_notifies_both_ends_once() {
        let radio = LoopbackRadio::new();
        let a = radio.attach("a");
        let b = radio.attach("b");
        let mut a_events = a.subscribe().await.unwrap();
        let mut b_events = b.subscribe().await.unwrap();
        a.connect(&id("b")).await.unwrap();
        let _ = a_events.recv().await;
        let _ = b_events.recv().await;

        assert!(radio.drop_link("a", "b"));
        assert!(!radio.drop_link("a", "b"));

        assert_eq!(a_events.recv().await, Some(LinkEvent::Disconnected { peer: id("b") }));
        assert_eq!(b_events.recv().await, Some(LinkEvent::Disconnected { peer: id("a") }));
        assert!(a_events.try_recv().is_err());
    }
}
