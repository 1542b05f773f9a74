//! Per-peer worker: admits a peer through the arbitrator, steps its handshake
//! context, and carries out the actions the state machine asks for.
//!
//! One worker exists per peer while it has queued input.  Results of
//! transport and ranging calls are fed straight back into the state machine
//! before the next queued event is looked at.

use std::collections::VecDeque;
use std::sync::Arc;

use nearlink_core::{
    ConnectionOrigin, Decision, DeviceBeaconId, HandshakeAction, HandshakeInput, IgnoreReason,
    PeerIdentity, RangingAddress, Role, RoleArbitrator, SessionParameters, SessionRegistry,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::application::handshake_service::{AgentEvent, Shared};
use crate::application::ranging::{RangingError, RangingUpdate};

/// Input queued for one peer.
#[derive(Debug)]
pub(crate) enum PeerInput {
    /// The peer's advertisement was seen while scanning.
    Advertised(DeviceBeaconId),
    /// The peer opened a link to us.
    InboundConnection,
    /// Anything for an already admitted handshake.
    Handshake(HandshakeInput),
    /// A connect timer armed by handshake `handshake_id` fired.
    ConnectTimer { handshake_id: u64, attempt: u32 },
}

pub(crate) struct PeerWorker {
    shared: Arc<Shared>,
    peer: PeerIdentity,
}

impl PeerWorker {
    pub(crate) fn new(shared: Arc<Shared>, peer: PeerIdentity) -> Self {
        Self { shared, peer }
    }

    /// Handles queued input until the queue is empty, then retires.
    pub(crate) async fn run(self, mut rx: mpsc::UnboundedReceiver<PeerInput>) {
        while let Some(input) = self.shared.next_or_retire(&self.peer, &mut rx) {
            self.handle(input).await;
        }
        trace!(peer = %self.peer, "peer worker retired");
    }

    async fn handle(&self, input: PeerInput) {
        match input {
            PeerInput::Advertised(beacon) => self.on_advertised(beacon).await,
            PeerInput::InboundConnection => self.on_inbound_connection().await,
            PeerInput::Handshake(input) => self.drain(VecDeque::from([input])).await,
            PeerInput::ConnectTimer {
                handshake_id,
                attempt,
            } => self.on_connect_timer(handshake_id, attempt).await,
        }
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    async fn on_advertised(&self, beacon: DeviceBeaconId) {
        match self.admit(|arb, peer, reg| arb.on_advertisement(peer, reg)).await {
            Decision::Become(role) => {
                self.on_role_assigned(role).await;
                self.drain(VecDeque::from([HandshakeInput::Discovered { beacon }]))
                    .await;
            }
            Decision::Ignore(IgnoreReason::AlreadyInProgress) => {
                trace!(peer = %self.peer, "advertisement from peer already in a handshake");
            }
            Decision::Ignore(reason) => {
                debug!(peer = %self.peer, ?reason, "advertisement ignored");
            }
        }
    }

    async fn on_inbound_connection(&self) {
        let remote = HandshakeInput::ConnectionEstablished(ConnectionOrigin::Remote);
        match self
            .admit(|arb, peer, reg| arb.on_inbound_connection(peer, reg))
            .await
        {
            Decision::Become(role) => {
                self.on_role_assigned(role).await;
                self.drain(VecDeque::from([remote])).await;
            }
            // Our own handshake with this peer decides what the link means.
            Decision::Ignore(IgnoreReason::AlreadyInProgress) => {
                self.drain(VecDeque::from([remote])).await;
            }
            Decision::Ignore(reason) => {
                info!(peer = %self.peer, ?reason, "refusing inbound connection");
                self.shared.transport.disconnect(&self.peer).await;
            }
        }
    }

    /// Arbitrates and, on `Become`, registers the handshake under one lock.
    ///
    /// Nothing new is admitted once shutdown has begun.
    async fn admit<F>(&self, decide: F) -> Decision
    where
        F: FnOnce(&RoleArbitrator, &PeerIdentity, &SessionRegistry) -> Decision,
    {
        let mut registry = self.shared.registry.lock().await;
        if self.shared.is_shutting_down() {
            if registry.is_live(&self.peer) {
                return Decision::Ignore(IgnoreReason::AlreadyInProgress);
            }
            return Decision::Ignore(IgnoreReason::Busy);
        }
        let decision = decide(&self.shared.arbitrator, &self.peer, &registry);
        if let Decision::Become(_) = decision {
            if let Err(e) = registry.begin(self.peer.clone()) {
                debug!(peer = %self.peer, error = %e, "registry refused handshake");
                return Decision::Ignore(IgnoreReason::Busy);
            }
        }
        decision
    }

    async fn on_role_assigned(&self, role: Role) {
        info!(peer = %self.peer, %role, "role assigned");
        self.shared
            .emit(AgentEvent::RoleAssigned {
                peer: self.peer.clone(),
                role,
            })
            .await;
        if self.shared.arbitrator.should_suspend_advertising(role) {
            debug!("suspending advertising");
            self.shared.transport.stop_advertise().await;
        }
    }

    // ── Stepping ──────────────────────────────────────────────────────────────

    async fn on_connect_timer(&self, handshake_id: u64, attempt: u32) {
        let input = HandshakeInput::ConnectTimedOut { attempt };
        let outcome = self
            .shared
            .registry
            .lock()
            .await
            .apply_to(&self.peer, handshake_id, input);
        let Some(outcome) = outcome else {
            return;
        };
        let mut follow_ups = VecDeque::new();
        for action in outcome.into_actions() {
            if let Some(input) = self.perform(action).await {
                follow_ups.push_back(input);
            }
        }
        self.drain(follow_ups).await;
    }

    async fn drain(&self, mut inputs: VecDeque<HandshakeInput>) {
        while let Some(input) = inputs.pop_front() {
            let outcome = self.shared.registry.lock().await.apply(&self.peer, input);
            let Some(outcome) = outcome else {
                trace!(peer = %self.peer, "no handshake for peer");
                continue;
            };
            for action in outcome.into_actions() {
                if let Some(follow_up) = self.perform(action).await {
                    inputs.push_back(follow_up);
                }
            }
        }
    }

    async fn perform(&self, action: HandshakeAction) -> Option<HandshakeInput> {
        let transport = &self.shared.transport;
        let peer = &self.peer;

        match action {
            HandshakeAction::Connect { attempt } => {
                self.arm_connect_timer(attempt).await;
                match transport.connect(peer).await {
                    Ok(()) => Some(HandshakeInput::ConnectRequested),
                    Err(e) => {
                        warn!(%peer, attempt, error = %e, "connect failed");
                        Some(HandshakeInput::ConnectFailed)
                    }
                }
            }
            HandshakeAction::ReadPeerAddress => {
                self.shared.cancel_connect_timer(peer);
                self.read_peer_address().await
            }
            HandshakeAction::PrepareControllerSession { peer_address } => {
                match self.prepare_session(peer_address).await {
                    Ok((params, local_address)) => Some(HandshakeInput::ParamsPrepared {
                        params,
                        local_address,
                    }),
                    Err(e) => {
                        warn!(%peer, error = %e, "controller session unavailable");
                        Some(HandshakeInput::PrepareFailed)
                    }
                }
            }
            HandshakeAction::WriteParams(bytes) => {
                match transport.write_params(peer, bytes).await {
                    Ok(()) => Some(HandshakeInput::WriteConfirmed),
                    Err(e) => {
                        warn!(%peer, error = %e, "params write failed");
                        Some(HandshakeInput::WriteFailed)
                    }
                }
            }
            HandshakeAction::StartRanging { role, params } => {
                self.start_ranging(role, params).await
            }
            HandshakeAction::StopRanging => {
                self.shared.ranging.stop(peer).await;
                None
            }
            HandshakeAction::Disconnect => {
                transport.disconnect(peer).await;
                None
            }
            HandshakeAction::Finish(reason) => {
                self.shared.cancel_connect_timer(peer);
                self.shared.registry.lock().await.remove(peer);
                info!(%peer, %reason, "handshake finished");
                self.shared
                    .emit(AgentEvent::Terminated {
                        peer: peer.clone(),
                        reason,
                    })
                    .await;
                None
            }
        }
    }

    async fn read_peer_address(&self) -> Option<HandshakeInput> {
        match self.shared.transport.read_address(&self.peer).await {
            Ok(bytes) => Some(HandshakeInput::PeerAddressRead(bytes)),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "address read failed");
                Some(HandshakeInput::ReadFailed)
            }
        }
    }

    async fn prepare_session(
        &self,
        peer_address: RangingAddress,
    ) -> Result<(SessionParameters, RangingAddress), RangingError> {
        let local_address = self.shared.ranging.controller_address().await?;
        let params = SessionParameters::generate(&mut rand::thread_rng(), peer_address);
        Ok((params, local_address))
    }

    async fn start_ranging(&self, role: Role, params: SessionParameters) -> Option<HandshakeInput> {
        let session_id = params.session_id;
        let ranging = &self.shared.ranging;
        let started = match role {
            Role::Controller => ranging.start_as_controller(&self.peer, params).await,
            Role::Controlee => ranging.start_as_controlee(&self.peer, params).await,
        };

        match started {
            Ok(updates) => {
                self.forward_updates(updates);
                info!(peer = %self.peer, %role, session_id, "ranging session started");
                self.shared
                    .emit(AgentEvent::SessionStarted {
                        peer: self.peer.clone(),
                        role,
                        session_id,
                    })
                    .await;
                let capacity = self.shared.config.max_concurrent_peers;
                if self.shared.arbitrator.should_stop_scanning(role, capacity) {
                    debug!("stopping scan");
                    self.shared.transport.stop_scan().await;
                }
                None
            }
            Err(e) => {
                warn!(peer = %self.peer, %role, error = %e, "ranging start failed");
                Some(HandshakeInput::RangingStartFailed)
            }
        }
    }

    /// Relays ranging output to the application until the session ends.
    fn forward_updates(&self, mut updates: mpsc::Receiver<RangingUpdate>) {
        let shared = Arc::clone(&self.shared);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if update == RangingUpdate::PeerDisconnected {
                    info!(%peer, "ranging engine lost peer");
                    shared.dispatch(&peer, PeerInput::Handshake(HandshakeInput::Disconnected));
                    break;
                }
                shared
                    .emit(AgentEvent::Ranging {
                        peer: peer.clone(),
                        update,
                    })
                    .await;
            }
        });
    }

    /// Schedules `ConnectTimedOut` for this attempt of the current handshake.
    async fn arm_connect_timer(&self, attempt: u32) {
        let handshake_id = match self.shared.registry.lock().await.get(&self.peer) {
            Some(context) => context.handshake_id(),
            None => return,
        };
        let shared = Arc::clone(&self.shared);
        let peer = self.peer.clone();
        let timeout = shared.config.connect_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.dispatch(
                &peer,
                PeerInput::ConnectTimer {
                    handshake_id,
                    attempt,
                },
            );
        });
        self.shared.set_connect_timer(&self.peer, timer.abort_handle());
    }
}
