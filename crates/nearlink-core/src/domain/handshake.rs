//! Per-peer handshake state machine.
//!
//! The machine is sans-IO: [`HandshakeContext::step`] consumes one
//! [`HandshakeInput`] (a radio or ranging event, or a local request) and
//! returns the [`HandshakeAction`]s the caller must perform.  Results of
//! those actions come back as further inputs.
//!
//! ```text
//!                       Controller                         Controlee
//! Idle ──Discovered──► Discovered ──► Connecting      Idle ──inbound link──►
//!                          │              │                ExposingAddress
//!                          └─link up──────┴──► AwaitingPeerAddress   │
//!                                                  │ address read    │ params written
//!                                                  ▼                 │
//!                                           ParamsExchanged          │
//!                                                  │ write confirmed │
//!                                                  ▼                 ▼
//!                                                 Active ◄───────────┘
//!
//! any live state ──disconnect / error / timeout / stop──► Terminated(reason)
//! ```
//!
//! `Terminated` is absorbing.  `Active` ignores everything except
//! termination and a competing params write (see below).
//!
//! # Competing Controllers
//!
//! When both devices discover each other inside one scan window, both become
//! Controller and both write params.  A Controller that receives a params
//! write compares beacon ids: the lower beacon yields and joins the peer's
//! session as Controlee, the higher beacon ignores the write.  Equal beacons
//! cannot be ordered and terminate with `ProtocolError`.

use std::cmp::Ordering;
use std::fmt;

use tracing::{debug, info, warn};

use crate::domain::peer::{ConnectionOrigin, DeviceBeaconId, PeerIdentity, Role};
use crate::protocol::codec::{decode_payload, encode_params, ProtocolError};
use crate::protocol::payload::{HandshakePayload, RangingAddress, SessionParameters};

/// Why a handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    /// The transport reported the link closed.
    Disconnected,
    /// Malformed payload, unexpected payload shape, or a failed transport or
    /// ranging operation.
    ProtocolError,
    /// The connection was not established in time.
    Timeout,
    /// A local stop request.
    StoppedByUser,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::Disconnected => "disconnected",
            TerminationReason::ProtocolError => "protocol error",
            TerminationReason::Timeout => "timeout",
            TerminationReason::StoppedByUser => "stopped by user",
        };
        f.write_str(s)
    }
}

/// Protocol state of one peer's handshake.
///
/// [`Connected`](HandshakeState::Connected) exists for completeness only.
/// `step` never leaves a context in it, so `state()` and snapshots never
/// report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Discovered,
    Connecting,
    /// Link up, role-specific state not yet entered.  `step` passes through
    /// it within a single call, so it is never observed between steps.
    Connected,
    AwaitingPeerAddress,
    ExposingAddress,
    ParamsExchanged,
    Active,
    Terminated(TerminationReason),
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Terminated(_))
    }
}

/// An event fed into [`HandshakeContext::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeInput {
    /// The peer's advertisement was seen and we won arbitration as Controller.
    Discovered { beacon: DeviceBeaconId },
    /// The transport accepted our connect request.
    ConnectRequested,
    ConnectionEstablished(ConnectionOrigin),
    ConnectFailed,
    /// The connect timer armed for `attempt` fired.
    ConnectTimedOut { attempt: u32 },
    /// Raw value of the peer's address characteristic.
    PeerAddressRead(Vec<u8>),
    ReadFailed,
    /// Fresh Controller session parameters plus our own Controller address.
    ParamsPrepared {
        params: SessionParameters,
        local_address: RangingAddress,
    },
    PrepareFailed,
    WriteConfirmed,
    WriteFailed,
    /// Raw value the peer wrote to our characteristic.
    WriteReceived(Vec<u8>),
    RangingStartFailed,
    Disconnected,
    StopRequested,
}

/// Work the caller must carry out on behalf of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Connect to the peer and arm the connect timer for `attempt`.
    Connect { attempt: u32 },
    ReadPeerAddress,
    /// Obtain a Controller address and generate session parameters for
    /// `peer_address`, then feed back [`HandshakeInput::ParamsPrepared`].
    PrepareControllerSession { peer_address: RangingAddress },
    /// Write these exact bytes to the peer's characteristic.
    WriteParams(Vec<u8>),
    StartRanging {
        role: Role,
        params: SessionParameters,
    },
    StopRanging,
    Disconnect,
    /// The context is terminal and may be released.
    Finish(TerminationReason),
}

/// Result of one [`HandshakeContext::step`].
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The input was accepted; perform these actions in order.
    Advanced(Vec<HandshakeAction>),
    /// The input does not apply in the current state (duplicate or stale).
    Ignored,
}

impl StepOutcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self, StepOutcome::Ignored)
    }

    /// Actions to perform; empty when ignored.
    pub fn into_actions(self) -> Vec<HandshakeAction> {
        match self {
            StepOutcome::Advanced(actions) => actions,
            StepOutcome::Ignored => Vec::new(),
        }
    }
}

/// Handshake record for one peer.
///
/// Created by the [`SessionRegistry`](crate::domain::registry::SessionRegistry),
/// which is also the only code that steps it.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    peer: PeerIdentity,
    handshake_id: u64,
    state: HandshakeState,
    role: Option<Role>,
    local_beacon: DeviceBeaconId,
    peer_beacon: Option<DeviceBeaconId>,
    connect_attempts: u32,
    max_connect_attempts: u32,
    peer_address: Option<RangingAddress>,
    /// Controller params awaiting write confirmation.
    pending: Option<SessionParameters>,
    session: Option<SessionParameters>,
}

impl HandshakeContext {
    /// `max_connect_attempts` counts the first attempt; values below 1 are raised to 1.
    pub fn new(peer: PeerIdentity, local_beacon: DeviceBeaconId, max_connect_attempts: u32) -> Self {
        Self {
            peer,
            handshake_id: 0,
            state: HandshakeState::Idle,
            role: None,
            local_beacon,
            peer_beacon: None,
            connect_attempts: 0,
            max_connect_attempts: max_connect_attempts.max(1),
            peer_address: None,
            pending: None,
            session: None,
        }
    }

    /// Tags the context with a registry-assigned id.
    pub fn with_handshake_id(mut self, handshake_id: u64) -> Self {
        self.handshake_id = handshake_id;
        self
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Distinguishes this handshake from earlier ones with the same peer.
    /// Zero unless set by [`with_handshake_id`](Self::with_handshake_id).
    pub fn handshake_id(&self) -> u64 {
        self.handshake_id
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// `None` until the first role-deciding input.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn peer_beacon(&self) -> Option<DeviceBeaconId> {
        self.peer_beacon
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// The other device's ranging address, once known.
    pub fn peer_address(&self) -> Option<&RangingAddress> {
        self.peer_address.as_ref()
    }

    /// Parameters handed to the ranging service; set on reaching `Active`.
    pub fn session(&self) -> Option<&SessionParameters> {
        self.session.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Advances the machine by one input.
    pub fn step(&mut self, input: HandshakeInput) -> StepOutcome {
        use HandshakeInput as In;
        use HandshakeState as S;

        let before = self.state;
        if before.is_terminal() {
            return StepOutcome::Ignored;
        }
        let is_controller = self.role == Some(Role::Controller);

        let outcome = match (before, input) {
            (_, In::StopRequested) => self.terminate(TerminationReason::StoppedByUser),
            (_, In::Disconnected) => self.terminate(TerminationReason::Disconnected),

            // ── Controller path ──────────────────────────────────────────
            (S::Idle, In::Discovered { beacon }) => {
                self.role = Some(Role::Controller);
                self.peer_beacon = Some(beacon);
                self.connect_attempts = 1;
                self.state = S::Discovered;
                advanced(vec![HandshakeAction::Connect { attempt: 1 }])
            }
            (S::Discovered, In::ConnectRequested) => {
                self.state = S::Connecting;
                advanced(Vec::new())
            }
            (S::Discovered | S::Connecting, In::ConnectionEstablished(ConnectionOrigin::Local))
                if is_controller =>
            {
                self.state = S::AwaitingPeerAddress;
                advanced(vec![HandshakeAction::ReadPeerAddress])
            }
            (S::Discovered | S::Connecting, In::ConnectFailed) => self.retry_connect(),
            (S::Discovered | S::Connecting, In::ConnectTimedOut { attempt })
                if attempt == self.connect_attempts =>
            {
                self.terminate(TerminationReason::Timeout)
            }
            (S::AwaitingPeerAddress, In::PeerAddressRead(bytes)) if self.peer_address.is_none() => {
                self.on_peer_address(&bytes)
            }
            (S::AwaitingPeerAddress, In::ReadFailed | In::PrepareFailed) => {
                self.terminate(TerminationReason::ProtocolError)
            }
            (S::AwaitingPeerAddress, In::ParamsPrepared { params, local_address })
                if self.peer_address.is_some() =>
            {
                let wire = encode_params(&params.with_peer_address(local_address));
                self.pending = Some(params);
                self.state = S::ParamsExchanged;
                advanced(vec![HandshakeAction::WriteParams(wire)])
            }
            (S::ParamsExchanged, In::WriteConfirmed) => match self.pending.take() {
                Some(params) => {
                    self.session = Some(params.clone());
                    self.state = S::Active;
                    advanced(vec![HandshakeAction::StartRanging {
                        role: Role::Controller,
                        params,
                    }])
                }
                None => self.terminate(TerminationReason::ProtocolError),
            },
            (S::ParamsExchanged, In::WriteFailed) => {
                self.terminate(TerminationReason::ProtocolError)
            }
            (
                S::Discovered | S::Connecting | S::AwaitingPeerAddress | S::ParamsExchanged | S::Active,
                In::WriteReceived(bytes),
            ) if is_controller => self.on_competing_params(&bytes),

            // ── Controlee path ───────────────────────────────────────────
            (S::Idle, In::ConnectionEstablished(ConnectionOrigin::Remote)) => {
                self.role = Some(Role::Controlee);
                self.state = S::ExposingAddress;
                advanced(Vec::new())
            }
            (S::ExposingAddress, In::WriteReceived(bytes)) => self.on_params_write(&bytes),

            (S::Active, In::RangingStartFailed) => {
                self.terminate(TerminationReason::ProtocolError)
            }

            _ => StepOutcome::Ignored,
        };

        if self.state != before {
            debug!(peer = %self.peer, from = ?before, to = ?self.state, "handshake transition");
        }
        outcome
    }

    fn retry_connect(&mut self) -> StepOutcome {
        if self.connect_attempts < self.max_connect_attempts {
            self.connect_attempts += 1;
            self.state = HandshakeState::Discovered;
            info!(peer = %self.peer, attempt = self.connect_attempts, "retrying connect");
            advanced(vec![HandshakeAction::Connect {
                attempt: self.connect_attempts,
            }])
        } else {
            self.terminate(TerminationReason::ProtocolError)
        }
    }

    fn on_peer_address(&mut self, bytes: &[u8]) -> StepOutcome {
        match decode_payload(bytes) {
            Ok(HandshakePayload::Address(address)) => {
                self.peer_address = Some(address.clone());
                advanced(vec![HandshakeAction::PrepareControllerSession {
                    peer_address: address,
                }])
            }
            other => self.reject_payload("address-only", other),
        }
    }

    fn on_params_write(&mut self, bytes: &[u8]) -> StepOutcome {
        match decode_payload(bytes) {
            Ok(HandshakePayload::Params(params)) => {
                self.become_active_controlee(params, Vec::new())
            }
            other => self.reject_payload("params", other),
        }
    }

    fn on_competing_params(&mut self, bytes: &[u8]) -> StepOutcome {
        let params = match decode_payload(bytes) {
            Ok(HandshakePayload::Params(params)) => params,
            other => return self.reject_payload("params", other),
        };
        let Some(peer_beacon) = self.peer_beacon else {
            return self.terminate(TerminationReason::ProtocolError);
        };

        match self.local_beacon.cmp(&peer_beacon) {
            Ordering::Greater => {
                debug!(peer = %self.peer, "both sides initiated; peer yields");
                StepOutcome::Ignored
            }
            Ordering::Less => {
                info!(peer = %self.peer, "both sides initiated; yielding as controlee");
                let mut actions = Vec::with_capacity(2);
                if self.state == HandshakeState::Active {
                    actions.push(HandshakeAction::StopRanging);
                }
                self.role = Some(Role::Controlee);
                self.pending = None;
                self.become_active_controlee(params, actions)
            }
            Ordering::Equal => {
                warn!(peer = %self.peer, beacon = %peer_beacon, "both sides initiated with the same beacon id");
                self.terminate(TerminationReason::ProtocolError)
            }
        }
    }

    fn become_active_controlee(
        &mut self,
        params: SessionParameters,
        mut actions: Vec<HandshakeAction>,
    ) -> StepOutcome {
        self.peer_address = Some(params.peer_ranging_address.clone());
        self.session = Some(params.clone());
        self.state = HandshakeState::Active;
        actions.push(HandshakeAction::StartRanging {
            role: Role::Controlee,
            params,
        });
        advanced(actions)
    }

    fn reject_payload(
        &mut self,
        expected: &str,
        got: Result<HandshakePayload, ProtocolError>,
    ) -> StepOutcome {
        match got {
            Ok(payload) => warn!(
                peer = %self.peer,
                expected,
                got = payload.kind(),
                "unexpected payload shape"
            ),
            Err(e) => warn!(peer = %self.peer, expected, error = %e, "undecodable payload"),
        }
        self.terminate(TerminationReason::ProtocolError)
    }

    fn terminate(&mut self, reason: TerminationReason) -> StepOutcome {
        let mut actions = Vec::with_capacity(3);
        if self.state == HandshakeState::Active {
            actions.push(HandshakeAction::StopRanging);
        }
        if self.state != HandshakeState::Idle && reason != TerminationReason::Disconnected {
            actions.push(HandshakeAction::Disconnect);
        }
        actions.push(HandshakeAction::Finish(reason));
        self.pending = None;
        self.state = HandshakeState::Terminated(reason);
        advanced(actions)
    }
}

fn advanced(actions: Vec<HandshakeAction>) -> StepOutcome {
    StepOutcome::Advanced(actions)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
