//! HandshakeService: the context object that owns the session registry and
//! the transport and ranging handles, and runs the event loop.
//!
//! # Event flow
//!
//! ```text
//! LinkTransport ──adverts / link events──► run() ──dispatch──► per-peer worker
//!                                                                   │
//!                                   SessionRegistry::apply ◄────────┤
//!                                                                   │
//!                          LinkTransport / RangingService ◄─actions─┘
//! ```
//!
//! Every event for one peer goes through that peer's worker, so no two
//! events for the same peer are ever handled concurrently.  Workers for
//! different peers run in parallel and retire once their queue is empty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use nearlink_core::{
    encode_address, ConnectionOrigin, DeviceBeaconId, HandshakeInput, HandshakeState, PeerIdentity,
    ProtocolError, RegistryConfig, Role, RoleArbitrator, RolePreference, SessionRegistry,
    TerminationReason,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::application::link::{Advertisement, LinkEvent, LinkTransport, TransportError};
use crate::application::peer_worker::{PeerInput, PeerWorker};
use crate::application::ranging::{RangingError, RangingService, RangingUpdate};

/// Capacity of the outbound [`AgentEvent`] channel.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// How long [`HandshakeService::shutdown`] waits for peer workers to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type WorkerMap = HashMap<PeerIdentity, mpsc::UnboundedSender<PeerInput>>;

/// Error type for the handshake service.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("ranging error: {0}")]
    Ranging(#[from] RangingError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Runtime settings for one [`HandshakeService`].
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Broadcast in our advertisement.
    pub beacon_id: DeviceBeaconId,
    pub role_preference: RolePreference,
    /// Maximum number of live handshakes.
    pub max_concurrent_peers: usize,
    /// Automatic connect retries after the first attempt.
    pub connect_retries: u32,
    /// Bound on one connect attempt.
    pub connect_timeout: Duration,
    pub suspend_advertising_as_controller: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            beacon_id: DeviceBeaconId::random(&mut rand::thread_rng()),
            role_preference: RolePreference::Auto,
            max_concurrent_peers: 1,
            connect_retries: 1,
            connect_timeout: Duration::from_secs(5),
            suspend_advertising_as_controller: true,
        }
    }
}

/// Events emitted by the service to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    RoleAssigned {
        peer: PeerIdentity,
        role: Role,
    },
    /// Session parameters were handed to the ranging engine.
    SessionStarted {
        peer: PeerIdentity,
        role: Role,
        session_id: u32,
    },
    /// Pass-through ranging output.
    Ranging {
        peer: PeerIdentity,
        update: RangingUpdate,
    },
    Terminated {
        peer: PeerIdentity,
        reason: TerminationReason,
    },
}

impl AgentEvent {
    pub fn peer(&self) -> &PeerIdentity {
        match self {
            AgentEvent::RoleAssigned { peer, .. }
            | AgentEvent::SessionStarted { peer, .. }
            | AgentEvent::Ranging { peer, .. }
            | AgentEvent::Terminated { peer, .. } => peer,
        }
    }
}

/// Point-in-time view of one peer's handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub state: HandshakeState,
    pub role: Option<Role>,
    pub session_id: Option<u32>,
}

/// State shared by the event loop and every peer worker.
pub(crate) struct Shared {
    pub(crate) config: HandshakeConfig,
    pub(crate) transport: Arc<dyn LinkTransport>,
    pub(crate) ranging: Arc<dyn RangingService>,
    pub(crate) registry: Mutex<SessionRegistry>,
    pub(crate) arbitrator: RoleArbitrator,
    pub(crate) events: mpsc::Sender<AgentEvent>,
    workers: StdMutex<WorkerMap>,
    /// Number of entries in `workers`.
    worker_count: watch::Sender<usize>,
    connect_timers: StdMutex<HashMap<PeerIdentity, AbortHandle>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    /// Queues `input` on the worker for `peer`, spawning one if needed.
    pub(crate) fn dispatch(self: &Arc<Self>, peer: &PeerIdentity, input: PeerInput) {
        let mut workers = self.lock_workers();
        let input = match workers.get(peer) {
            Some(tx) => match tx.send(input) {
                Ok(()) => return,
                Err(mpsc::error::SendError(input)) => input,
            },
            None => input,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(input);
        workers.insert(peer.clone(), tx);
        self.worker_count.send_replace(workers.len());
        let worker = PeerWorker::new(Arc::clone(self), peer.clone());
        tokio::spawn(worker.run(rx));
    }

    /// Next queued input for `peer`, or `None` after removing its worker.
    ///
    /// Runs under the same lock as [`dispatch`](Self::dispatch), so input is
    /// either seen here or routed to a fresh worker.
    pub(crate) fn next_or_retire(
        &self,
        peer: &PeerIdentity,
        rx: &mut mpsc::UnboundedReceiver<PeerInput>,
    ) -> Option<PeerInput> {
        let mut workers = self.lock_workers();
        match rx.try_recv() {
            Ok(input) => Some(input),
            Err(_) => {
                workers.remove(peer);
                self.worker_count.send_replace(workers.len());
                None
            }
        }
    }

    /// `true` once [`HandshakeService::shutdown`] has begun.
    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Records the pending connect timer for `peer`, aborting the previous one.
    pub(crate) fn set_connect_timer(&self, peer: &PeerIdentity, timer: AbortHandle) {
        if let Some(previous) = self.lock_timers().insert(peer.clone(), timer) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_connect_timer(&self, peer: &PeerIdentity) {
        if let Some(timer) = self.lock_timers().remove(peer) {
            timer.abort();
        }
    }

    pub(crate) async fn emit(&self, event: AgentEvent) {
        if self.events.send(event).await.is_err() {
            debug!("agent event receiver dropped");
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, WorkerMap> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<PeerIdentity, AbortHandle>> {
        self.connect_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives discovery, arbitration and the handshake for every nearby peer.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct HandshakeService {
    shared: Arc<Shared>,
}

impl HandshakeService {
    /// Creates the service and returns it with the receiver for its events.
    pub fn new(
        config: HandshakeConfig,
        transport: Arc<dyn LinkTransport>,
        ranging: Arc<dyn RangingService>,
    ) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let registry = SessionRegistry::new(RegistryConfig {
            capacity: config.max_concurrent_peers.max(1),
            connect_retries: config.connect_retries,
            local_beacon: config.beacon_id,
        });
        let arbitrator = RoleArbitrator::new(config.role_preference)
            .with_advertising_suspension(config.suspend_advertising_as_controller);

        let shared = Arc::new(Shared {
            config,
            transport,
            ranging,
            registry: Mutex::new(registry),
            arbitrator,
            events,
            workers: StdMutex::new(HashMap::new()),
            worker_count: watch::Sender::new(0),
            connect_timers: StdMutex::new(HashMap::new()),
            shutdown,
        });
        (Self { shared }, rx)
    }

    pub fn beacon_id(&self) -> DeviceBeaconId {
        self.shared.config.beacon_id
    }

    /// Runs the event loop until [`shutdown`](Self::shutdown) is called or
    /// the link event stream closes.
    ///
    /// Startup order: prepare the Controlee address, expose it, subscribe to
    /// link events, then advertise and scan.  A forced Controller does not
    /// advertise and a forced Controlee does not scan.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] if any startup step fails.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        let transport = &self.shared.transport;
        let preference = self.shared.config.role_preference;

        let address = self.shared.ranging.prepare_controlee().await?;
        transport.expose_address(encode_address(&address)?).await?;
        let mut link_events = transport.subscribe().await?;

        if preference != RolePreference::Controller {
            transport.advertise(self.shared.config.beacon_id).await?;
        }
        let mut adverts = if preference != RolePreference::Controlee {
            Some(transport.scan().await?)
        } else {
            None
        };

        info!(
            beacon = %self.shared.config.beacon_id,
            ?preference,
            %address,
            "handshake service running"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                advert = next_advert(&mut adverts) => match advert {
                    Some(Advertisement { peer, beacon }) => {
                        self.shared.dispatch(&peer, PeerInput::Advertised(beacon));
                    }
                    None => {
                        debug!("scan stream ended");
                        adverts = None;
                    }
                },
                event = link_events.recv() => match event {
                    Some(event) => self.route(event),
                    None => {
                        warn!("link event stream closed");
                        break;
                    }
                },
            }
        }

        info!("handshake service event loop finished");
        Ok(())
    }

    /// Requests a stop of the handshake with `peer`.  Repeated calls are no-ops.
    pub fn stop_peer(&self, peer: &PeerIdentity) {
        self.shared
            .dispatch(peer, PeerInput::Handshake(HandshakeInput::StopRequested));
    }

    /// Stops every live handshake, stops advertising and scanning, and ends
    /// [`run`](Self::run).
    ///
    /// Each stop is queued on the peer's worker behind whatever it is doing,
    /// and the call returns once every worker has drained, or after a five
    /// second grace period.  No new handshakes are admitted from here on.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);

        let live: Vec<PeerIdentity> = {
            let registry = self.shared.registry.lock().await;
            registry
                .peers()
                .into_iter()
                .filter(|peer| registry.is_live(peer))
                .collect()
        };
        for peer in &live {
            self.stop_peer(peer);
        }

        let mut workers = self.shared.worker_count.subscribe();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, workers.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !drained {
            warn!(stopping = live.len(), "peer workers still busy at shutdown");
        }

        self.shared.transport.stop_advertise().await;
        self.shared.transport.stop_scan().await;
        info!("handshake service stopped");
    }

    /// Current state of the handshake with `peer`, if one exists.
    pub async fn snapshot(&self, peer: &PeerIdentity) -> Option<PeerSnapshot> {
        let registry = self.shared.registry.lock().await;
        registry.get(peer).map(|ctx| PeerSnapshot {
            state: ctx.state(),
            role: ctx.role(),
            session_id: ctx.session().map(|s| s.session_id),
        })
    }

    /// Number of live handshakes.
    pub async fn active_count(&self) -> usize {
        self.shared.registry.lock().await.active_count()
    }

    fn route(&self, event: LinkEvent) {
        let peer = event.peer().clone();
        let input = match event {
            LinkEvent::Connected {
                origin: ConnectionOrigin::Remote,
                ..
            } => PeerInput::InboundConnection,
            LinkEvent::Connected { origin, .. } => {
                PeerInput::Handshake(HandshakeInput::ConnectionEstablished(origin))
            }
            LinkEvent::Disconnected { .. } => PeerInput::Handshake(HandshakeInput::Disconnected),
            LinkEvent::WriteReceived { bytes, .. } => {
                PeerInput::Handshake(HandshakeInput::WriteReceived(bytes))
            }
        };
        self.shared.dispatch(&peer, input);
    }
}

async fn next_advert(
    adverts: &mut Option<mpsc::Receiver<Advertisement>>,
) -> Option<Advertisement> {
    match adverts {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ranging::MockRangingService;
    use crate::infrastructure::loopback::LoopbackRadio;
    use nearlink_core::{encode_params, RangingAddress, SessionKey, SessionParameters};

    fn config(beacon: u32, preference: RolePreference) -> HandshakeConfig {
        HandshakeConfig {
            beacon_id: DeviceBeaconId(beacon),
            role_preference: preference,
            connect_timeout: Duration::from_millis(500),
            ..HandshakeConfig::default()
        }
    }

    async fn next_terminated(rx: &mut mpsc::Receiver<AgentEvent>) -> Option<AgentEvent> {
        let wait = async {
            while let Some(event) = rx.recv().await {
                if matches!(event, AgentEvent::Terminated { .. }) {
                    return Some(event);
                }
            }
            None
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_default_config_matches_documented_values() {
        let cfg = HandshakeConfig::default();
        assert_eq!(cfg.role_preference, RolePreference::Auto);
        assert_eq!(cfg.max_concurrent_peers, 1);
        assert_eq!(cfg.connect_retries, 1);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert!(cfg.suspend_advertising_as_controller);
    }

    #[tokio::test]
    async fn test_run_fails_when_ranging_cannot_prepare() {
        // Arrange
        let radio = LoopbackRadio::new();
        let mut ranging = MockRangingService::new();
        ranging
            .expect_prepare_controlee()
            .times(1)
            .returning(|| Err(RangingError::Unavailable("radio off".to_string())));
        let (service, _events) = HandshakeService::new(
            config(1, RolePreference::Auto),
            Arc::new(radio.attach("device")),
            Arc::new(ranging),
        );

        // Act
        let result = service.run().await;

        // Assert
        assert!(matches!(result, Err(AgentError::Ranging(RangingError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn test_run_rejects_address_that_cannot_be_exposed() {
        let radio = LoopbackRadio::new();
        let mut ranging = MockRangingService::new();
        ranging
            .expect_prepare_controlee()
            .returning(|| Ok(RangingAddress::new(vec![1, 2, 3]).unwrap()));
        let (service, _events) = HandshakeService::new(
            config(1, RolePreference::Auto),
            Arc::new(radio.attach("device")),
            Arc::new(ranging),
        );

        let result = service.run().await;

        assert!(matches!(
            result,
            Err(AgentError::Protocol(ProtocolError::UnencodableAddress { len: 3 }))
        ));
    }

    #[tokio::test]
    async fn test_ranging_start_failure_terminates_with_protocol_error() {
        // Arrange: a controlee whose ranging engine refuses every session.
        let radio = LoopbackRadio::new();
        let mut ranging = MockRangingService::new();
        ranging
            .expect_prepare_controlee()
            .returning(|| Ok(RangingAddress::new(vec![0x12, 0x34]).unwrap()));
        ranging
            .expect_start_as_controlee()
            .times(1)
            .returning(|_, _| Err(RangingError::Rejected("bad key".to_string())));
        ranging.expect_stop().returning(|_| ());

        let (service, mut events) = HandshakeService::new(
            config(1, RolePreference::Controlee),
            Arc::new(radio.attach("controlee")),
            Arc::new(ranging),
        );
        let runner = service.clone();
        let run = tokio::spawn(async move { runner.run().await });

        let peer = radio.attach("initiator");
        let controlee = PeerIdentity::from("controlee");
        let params = SessionParameters {
            session_id: 9,
            session_key: SessionKey::from_bytes([3; 8]),
            peer_ranging_address: RangingAddress::new(vec![0xAB]).unwrap(),
        };

        // Act
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio_test::assert_ok!(peer.connect(&controlee).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio_test::assert_ok!(peer.write_params(&controlee, encode_params(&params)).await);

        // Assert
        assert_eq!(
            next_terminated(&mut events).await,
            Some(AgentEvent::Terminated {
                peer: PeerIdentity::from("initiator"),
                reason: TerminationReason::ProtocolError,
            })
        );

        service.shutdown().await;
        tokio_test::assert_ok!(run.await.unwrap());
    }

    #[tokio::test]
    async fn test_run_returns_immediately_after_shutdown() {
        let radio = LoopbackRadio::new();
        let ranging = MockRangingService::new();
        let (service, _events) = HandshakeService::new(
            config(1, RolePreference::Auto),
            Arc::new(radio.attach("device")),
            Arc::new(ranging),
        );

        service.shutdown().await;

        tokio_test::assert_ok!(service.run().await);
    }
}
