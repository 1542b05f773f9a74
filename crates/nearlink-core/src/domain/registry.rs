//! SessionRegistry: the single owner of every [`HandshakeContext`].
//!
//! The registry answers "do we already have a handshake with this peer" and
//! is the only path through which a context is stepped.  Callers that share
//! it between tasks wrap it in a mutex, so `begin` is a check-and-insert under
//! one lock.  That is what settles two simultaneous initiations for the same
//! peer: exactly one `begin` wins, the other sees `AlreadyInProgress`.
//!
//! # Lifecycle
//!
//! ```text
//! begin ──► live (stepped via apply) ──► terminated ──► remove / purge
//!                                            │
//!                               begin again purges it first
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::domain::handshake::{HandshakeContext, HandshakeInput, StepOutcome};
use crate::domain::peer::{DeviceBeaconId, PeerIdentity};

/// Error type for registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A non-terminated handshake for this peer exists.
    #[error("handshake with {0} already in progress")]
    AlreadyInProgress(PeerIdentity),

    /// The configured maximum of live handshakes is reached.
    #[error("registry at capacity ({capacity} live handshake(s))")]
    AtCapacity { capacity: usize },
}

/// Registry limits and the values stamped into every new context.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of live (non-terminated) handshakes.
    pub capacity: usize,
    /// Automatic connect retries after the first attempt.
    pub connect_retries: u32,
    /// Our own beacon id.
    pub local_beacon: DeviceBeaconId,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            connect_retries: 1,
            local_beacon: DeviceBeaconId(0),
        }
    }
}

/// Mapping from [`PeerIdentity`] to [`HandshakeContext`].
#[derive(Debug, Default)]
pub struct SessionRegistry {
    config: RegistryConfig,
    contexts: HashMap<PeerIdentity, HandshakeContext>,
    last_handshake_id: u64,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            contexts: HashMap::new(),
            last_handshake_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn local_beacon(&self) -> DeviceBeaconId {
        self.config.local_beacon
    }

    /// Creates a fresh context for `peer`.
    ///
    /// Every context gets a handshake id that no earlier context had.  A terminated context left over for `peer` is purged first.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::AlreadyInProgress`] if a live context exists for `peer`.
    /// - [`RegistryError::AtCapacity`] if the live-context limit is reached.
    pub fn begin(&mut self, peer: PeerIdentity) -> Result<&mut HandshakeContext, RegistryError> {
        if self.is_live(&peer) {
            return Err(RegistryError::AlreadyInProgress(peer));
        }
        if self.is_full() {
            return Err(RegistryError::AtCapacity {
                capacity: self.config.capacity,
            });
        }

        self.last_handshake_id += 1;
        let context = HandshakeContext::new(
            peer.clone(),
            self.config.local_beacon,
            self.config.connect_retries.saturating_add(1),
        )
        .with_handshake_id(self.last_handshake_id);
        debug!(%peer, handshake_id = self.last_handshake_id, live = self.active_count() + 1, "handshake begun");
        match self.contexts.entry(peer) {
            // Only a terminated context can be here after the checks above.
            Entry::Occupied(mut slot) => {
                slot.insert(context);
                Ok(slot.into_mut())
            }
            Entry::Vacant(slot) => Ok(slot.insert(context)),
        }
    }

    pub fn get(&self, peer: &PeerIdentity) -> Option<&HandshakeContext> {
        self.contexts.get(peer)
    }

    /// Removes and returns the context for `peer`, live or not.
    pub fn remove(&mut self, peer: &PeerIdentity) -> Option<HandshakeContext> {
        self.contexts.remove(peer)
    }

    /// Number of non-terminated contexts.
    pub fn active_count(&self) -> usize {
        self.contexts.values().filter(|c| !c.is_terminal()).count()
    }

    /// `true` if a non-terminated context exists for `peer`.
    pub fn is_live(&self, peer: &PeerIdentity) -> bool {
        self.contexts.get(peer).is_some_and(|c| !c.is_terminal())
    }

    pub fn is_full(&self) -> bool {
        self.active_count() >= self.config.capacity
    }

    /// Steps the context for `peer`.
    ///
    /// Returns `None` if there is no context for `peer`.
    pub fn apply(&mut self, peer: &PeerIdentity, input: HandshakeInput) -> Option<StepOutcome> {
        let context = self.contexts.get_mut(peer)?;
        let state = context.state();
        let label = input_label(&input);
        let outcome = context.step(input);
        if outcome.is_ignored() {
            debug!(%peer, ?state, input = label, "input ignored");
        }
        Some(outcome)
    }

    /// Like [`apply`](Self::apply), but only if the context for `peer` is
    /// still the one tagged `handshake_id`.
    ///
    /// Used for inputs scheduled by one handshake that may fire after a newer
    /// handshake with the same peer has begun.
    pub fn apply_to(
        &mut self,
        peer: &PeerIdentity,
        handshake_id: u64,
        input: HandshakeInput,
    ) -> Option<StepOutcome> {
        let current = self.contexts.get(peer)?.handshake_id();
        if current != handshake_id {
            debug!(
                %peer,
                handshake_id,
                current,
                input = input_label(&input),
                "input for an earlier handshake dropped"
            );
            return None;
        }
        self.apply(peer, input)
    }

    /// Sends `StopRequested` to every live context.
    ///
    /// Returns the outcome for each peer that was stopped, so the caller can
    /// carry out the teardown actions.  Terminated contexts are left for the
    /// caller to remove once those actions are done.
    pub fn stop_all(&mut self) -> Vec<(PeerIdentity, StepOutcome)> {
        let mut stopped: Vec<(PeerIdentity, StepOutcome)> = self
            .contexts
            .iter_mut()
            .filter(|(_, c)| !c.is_terminal())
            .map(|(peer, c)| (peer.clone(), c.step(HandshakeInput::StopRequested)))
            .collect();
        stopped.sort_by(|a, b| a.0.cmp(&b.0));
        stopped
    }

    /// Drops every terminated context and returns how many were dropped.
    pub fn purge_terminated(&mut self) -> usize {
        let before = self.contexts.len();
        self.contexts.retain(|_, c| !c.is_terminal());
        before - self.contexts.len()
    }

    /// Peers with a context, live or terminated, in sorted order.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> = self.contexts.keys().cloned().collect();
        peers.sort();
        peers
    }
}

/// Payload-free name of an input for log lines.
fn input_label(input: &HandshakeInput) -> &'static str {
    match input {
        HandshakeInput::Discovered { .. } => "discovered",
        HandshakeInput::ConnectRequested => "connect-requested",
        HandshakeInput::ConnectionEstablished(_) => "connection-established",
        HandshakeInput::ConnectFailed => "connect-failed",
        HandshakeInput::ConnectTimedOut { .. } => "connect-timed-out",
        HandshakeInput::PeerAddressRead(_) => "peer-address-read",
        HandshakeInput::ReadFailed => "read-failed",
        HandshakeInput::ParamsPrepared { .. } => "params-prepared",
        HandshakeInput::PrepareFailed => "prepare-failed",
        HandshakeInput::WriteConfirmed => "write-confirmed",
        HandshakeInput::WriteFailed => "write-failed",
        HandshakeInput::WriteReceived(_) => "write-received",
        HandshakeInput::RangingStartFailed => "ranging-start-failed",
        HandshakeInput::Disconnected => "disconnected",
        HandshakeInput::StopRequested => "stop-requested",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
