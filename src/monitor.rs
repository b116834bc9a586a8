//! Connection health classification.
//!
//! Every signal re-derives the state from the current facts; the only
//! memory is the disconnect grace timer.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::peer::events::TransportEvent;
use crate::peer::types::{ConnectionState, IceConnectionState, PeerConnectionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthFacts {
    pub ice: IceConnectionState,
    pub connection: PeerConnectionState,
    pub local_tracks: usize,
    pub remote_tracks: usize,
}

impl Default for HealthFacts {
    fn default() -> Self {
        Self {
            ice: IceConnectionState::New,
            connection: PeerConnectionState::New,
            local_tracks: 0,
            remote_tracks: 0,
        }
    }
}

pub fn classify(facts: &HealthFacts) -> ConnectionState {
    if facts.ice == IceConnectionState::Failed || facts.connection == PeerConnectionState::Failed {
        return ConnectionState::Failed;
    }
    match facts.ice {
        IceConnectionState::Connected | IceConnectionState::Completed => {
            if facts.remote_tracks > 0 {
                ConnectionState::Connected
            } else {
                ConnectionState::DegradedNoMedia
            }
        }
        IceConnectionState::Disconnected | IceConnectionState::Closed => {
            ConnectionState::Disconnected
        }
        IceConnectionState::Checking => ConnectionState::Connecting,
        IceConnectionState::New | IceConnectionState::Failed => {
            if facts.connection == PeerConnectionState::Connecting {
                ConnectionState::Connecting
            } else {
                ConnectionState::Idle
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub state: ConnectionState,
    pub changed: bool,
    /// Hand over to the reconnection controller.
    pub escalate: bool,
}

#[derive(Debug)]
pub struct ConnectionMonitor {
    facts: HealthFacts,
    state: ConnectionState,
    grace: Duration,
    grace_deadline: Option<Instant>,
    grace_spent: bool,
}

impl ConnectionMonitor {
    pub fn new(grace: Duration) -> Self {
        Self {
            facts: HealthFacts::default(),
            state: ConnectionState::Idle,
            grace,
            grace_deadline: None,
            grace_spent: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn facts(&self) -> &HealthFacts {
        &self.facts
    }

    pub fn grace_pending(&self) -> bool {
        self.grace_deadline.is_some()
    }

    pub fn set_local_tracks(&mut self, count: usize) -> Verdict {
        self.facts.local_tracks = count;
        self.evaluate()
    }

    /// Applies a transport signal; `None` when the event carries no health information.
    pub fn observe(&mut self, event: &TransportEvent) -> Option<Verdict> {
        match event {
            TransportEvent::IceConnectionState(state) => self.facts.ice = *state,
            TransportEvent::ConnectionState(state) => self.facts.connection = *state,
            TransportEvent::TrackAdded { .. } => self.facts.remote_tracks += 1,
            _ => return None,
        }
        Some(self.evaluate())
    }

    /// Foreground/visibility re-check. Escalates again if the connection is
    /// still down after its grace period was used up.
    pub fn recheck(&mut self) -> Verdict {
        let mut verdict = self.evaluate();
        if verdict.state == ConnectionState::Disconnected && self.grace_spent {
            verdict.escalate = true;
        }
        verdict
    }

    /// Resolves when the grace timer fires; pending forever when none is armed.
    pub async fn grace_expired(&mut self) -> Verdict {
        let Some(deadline) = self.grace_deadline else {
            return std::future::pending().await;
        };
        sleep_until(deadline).await;
        self.grace_deadline = None;
        self.grace_spent = true;

        let mut verdict = self.evaluate();
        if self.facts.ice == IceConnectionState::Disconnected {
            warn!(
                "still disconnected after {} ms grace, escalating",
                self.grace.as_millis()
            );
            verdict.escalate = true;
        }
        verdict
    }

    fn evaluate(&mut self) -> Verdict {
        let state = classify(&self.facts);
        let changed = state != self.state;
        let mut escalate = false;

        match state {
            ConnectionState::Failed => {
                self.grace_deadline = None;
                escalate = true;
            }
            ConnectionState::Disconnected if self.facts.ice == IceConnectionState::Disconnected => {
                if self.grace_deadline.is_none() && !self.grace_spent {
                    debug!("disconnected, grace period of {} ms started", self.grace.as_millis());
                    self.grace_deadline = Some(Instant::now() + self.grace);
                }
            }
            ConnectionState::Disconnected => {
                // closed: nothing left to recover
                self.grace_deadline = None;
            }
            _ => {
                if self.grace_deadline.take().is_some() {
                    info!("connection recovered within grace period");
                }
                self.grace_spent = false;
            }
        }

        if changed {
            info!(from = ?self.state, to = ?state, "connection state");
        }
        self.state = state;
        Verdict {
            state,
            changed,
            escalate,
        }
    }
}
