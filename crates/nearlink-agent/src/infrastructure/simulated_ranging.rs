//! Ranging engine stand-in that produces synthetic measurements.
//!
//! Each started session gets a task that emits a [`RangingUpdate::Position`]
//! every `interval` until the session is stopped.  Distances drift around a
//! random starting point so the demo output looks alive.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nearlink_core::{PeerIdentity, RangingAddress, Role, SessionParameters};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::application::ranging::{RangingError, RangingService, RangingUpdate};

const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// What the engine knows about one running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedSession {
    pub role: Role,
    pub session_id: u32,
    pub peer_address: RangingAddress,
}

struct Running {
    session: SimulatedSession,
    task: JoinHandle<()>,
}

pub struct SimulatedRanging {
    controlee_address: RangingAddress,
    controller_address: RangingAddress,
    interval: Duration,
    sessions: Mutex<HashMap<PeerIdentity, Running>>,
}

impl SimulatedRanging {
    pub fn new(
        controlee_address: RangingAddress,
        controller_address: RangingAddress,
        interval: Duration,
    ) -> Self {
        Self {
            controlee_address,
            controller_address,
            interval,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Engine with random short addresses for both roles.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the address constructor is fallible.
    pub fn random(interval: Duration) -> Result<Self, RangingError> {
        let mut rng = rand::thread_rng();
        let controlee = short_address(rng.gen())?;
        let controller = short_address(rng.gen())?;
        Ok(Self::new(controlee, controller, interval))
    }

    /// Snapshot of running sessions, keyed by peer.
    pub fn sessions(&self) -> HashMap<PeerIdentity, SimulatedSession> {
        self.lock()
            .iter()
            .map(|(peer, running)| (peer.clone(), running.session.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerIdentity, Running>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(
        &self,
        peer: &PeerIdentity,
        role: Role,
        params: SessionParameters,
    ) -> mpsc::Receiver<RangingUpdate> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let interval = self.interval;
        let start_m: f32 = rand::thread_rng().gen_range(0.5..5.0);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut distance_m = start_m;
            loop {
                ticker.tick().await;
                let update = {
                    let mut rng = rand::thread_rng();
                    distance_m = (distance_m + rng.gen_range(-0.2..0.2)).max(0.1);
                    RangingUpdate::Position {
                        distance_m,
                        azimuth_deg: rng.gen_range(-60.0..60.0),
                        elevation_deg: None,
                    }
                };
                if tx.send(update).await.is_err() {
                    break;
                }
            }
        });

        let session = SimulatedSession {
            role,
            session_id: params.session_id,
            peer_address: params.peer_ranging_address,
        };
        debug!(%peer, %role, session_id = session.session_id, "simulated ranging started");
        if let Some(previous) = self.lock().insert(peer.clone(), Running { session, task }) {
            previous.task.abort();
        }
        rx
    }
}

fn short_address(value: u16) -> Result<RangingAddress, RangingError> {
    RangingAddress::new(value.to_be_bytes().to_vec())
        .map_err(|e| RangingError::Unavailable(e.to_string()))
}

#[async_trait]
impl RangingService for SimulatedRanging {
    async fn prepare_controlee(&self) -> Result<RangingAddress, RangingError> {
        Ok(self.controlee_address.clone())
    }

    async fn controller_address(&self) -> Result<RangingAddress, RangingError> {
        Ok(self.controller_address.clone())
    }

    async fn start_as_controller(
        &self,
        peer: &PeerIdentity,
        params: SessionParameters,
    ) -> Result<mpsc::Receiver<RangingUpdate>, RangingError> {
        Ok(self.start(peer, Role::Controller, params))
    }

    async fn start_as_controlee(
        &self,
        peer: &PeerIdentity,
        params: SessionParameters,
    ) -> Result<mpsc::Receiver<RangingUpdate>, RangingError> {
        Ok(self.start(peer, Role::Controlee, params))
    }

    async fn stop(&self, peer: &PeerIdentity) {
        if let Some(running) = self.lock().remove(peer) {
            running.task.abort();
            debug!(%peer, "simulated ranging stopped");
        }
    }
}

impl Drop for SimulatedRanging {
    fn drop(&mut self) {
        for (_, running) in self.lock().drain() {
            running.task.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nearlink_core::SessionKey;

    fn params(session_id: u32) -> SessionParameters {
        SessionParameters {
            session_id,
            session_key: SessionKey::from_bytes([1; 8]),
            peer_ranging_address: RangingAddress::new(vec![0xBE, 0xEF]).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_random_engine_uses_short_addresses() {
        let engine = SimulatedRanging::random(Duration::from_millis(10)).unwrap();

        assert_eq!(engine.prepare_controlee().await.unwrap().len(), 2);
        assert_eq!(engine.controller_address().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_started_session_emits_positions() {
        // Arrange
        let engine = SimulatedRanging::random(Duration::from_millis(5)).unwrap();
        let peer = PeerIdentity::from("peer");

        // Act
        let mut updates = engine.start_as_controller(&peer, params(77)).await.unwrap();
        let first = updates.recv().await;

        // Assert
        assert!(matches!(first, Some(RangingUpdate::Position { distance_m, .. }) if distance_m > 0.0));
        let sessions = engine.sessions();
        assert_eq!(sessions[&peer].role, Role::Controller);
        assert_eq!(sessions[&peer].session_id, 77);
    }

    #[tokio::test]
    async fn test_stop_ends_the_update_stream() {
        let engine = SimulatedRanging::random(Duration::from_millis(5)).unwrap();
        let peer = PeerIdentity::from("peer");
        let mut updates = engine.start_as_controlee(&peer, params(1)).await.unwrap();

        engine.stop(&peer).await;

        while updates.recv().await.is_some() {}
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_for_unknown_peer_is_a_no_op() {
        let engine = SimulatedRanging::random(Duration::from_millis(5)).unwrap();
        engine.stop(&PeerIdentity::from("nobody")).await;
        assert!(engine.sessions().is_empty());
    }
}
