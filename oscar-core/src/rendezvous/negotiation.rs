//! Per-cookie negotiation state.
//!
//! ```text
//!  Proposed ──► Stage1Direct ──► Stage2Proxy ──► Stage3Proxy
//!     │              │                │               │
//!     │              └───────┬────────┴───────────────┘
//!     │                      ▼
//!     │                  Connected ──► Completed
//!     │
//!     └──── any non-terminal ──► Cancelled | Failed
//! ```
//!
//! Pure bookkeeping: no I/O, no clocks read. The engine feeds it events
//! and acts on the results.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

use crate::error::{CancelReason, OscarError, RendezvousFailure};
use crate::rendezvous::{Capability, Cookie};

/// Which cookie table a negotiation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// We sent the first proposal.
    Local,
    /// The peer sent the first proposal.
    Remote,
}

/// Handle a feature uses to refer to one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegotiationId {
    pub origin: Origin,
    pub cookie: Cookie,
}

impl fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.origin {
            Origin::Local => "local",
            Origin::Remote => "remote",
        };
        write!(f, "{origin}:{}", self.cookie)
    }
}

/// Transport stage, numbered as on the wire.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Direct = 1,
    Proxy2 = 2,
    Proxy3 = 3,
}

impl Stage {
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Direct),
            2 => Some(Self::Proxy2),
            3 => Some(Self::Proxy3),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Direct => Some(Self::Proxy2),
            Self::Proxy2 => Some(Self::Proxy3),
            Self::Proxy3 => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct stage",
            Self::Proxy2 => "proxy stage 2",
            Self::Proxy3 => "proxy stage 3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Proposed,
    Stage1Direct,
    Stage2Proxy,
    Stage3Proxy,
    Connected,
    Completed,
    Cancelled(CancelReason),
    Failed(RendezvousFailure),
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled(_) | Self::Failed(_))
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage1Direct => Some(Stage::Direct),
            Self::Stage2Proxy => Some(Stage::Proxy2),
            Self::Stage3Proxy => Some(Stage::Proxy3),
            _ => None,
        }
    }

    fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Direct => Self::Stage1Direct,
            Stage::Proxy2 => Self::Stage2Proxy,
            Stage::Proxy3 => Self::Stage3Proxy,
        }
    }
}

/// Peer transport parameters from the latest proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub proxy_ip: Option<Ipv4Addr>,
    pub client_ip: Option<Ipv4Addr>,
    pub verified_ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub use_proxy: bool,
}

// ── Negotiation ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Negotiation {
    pub id: NegotiationId,
    pub peer: String,
    pub capability: Capability,
    pub endpoints: Endpoints,
    pub error_code: u16,
    state: NegotiationState,
    deadline: Instant,
    attempt: u32,
    socket_live: bool,
    accepted: bool,
}

impl Negotiation {
    pub fn new(
        id: NegotiationId,
        peer: impl Into<String>,
        capability: Capability,
        deadline: Instant,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            capability,
            endpoints: Endpoints::default(),
            error_code: 0,
            state: NegotiationState::Proposed,
            deadline,
            attempt: 0,
            socket_live: false,
            accepted: false,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn stage(&self) -> Option<Stage> {
        self.state.stage()
    }

    /// Generation of the current transport attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_current(&self, attempt: u32) -> bool {
        self.attempt == attempt && self.stage().is_some()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the stage deadline passed while still negotiating.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_terminal() && self.state != NegotiationState::Connected && now >= self.deadline
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Move to `stage`, starting a new attempt. Stages only move forward.
    pub fn enter_stage(&mut self, stage: Stage, deadline: Instant) -> Result<u32, OscarError> {
        let allowed = match &self.state {
            NegotiationState::Proposed => true,
            s => s.stage().is_some_and(|current| stage > current),
        };
        if !allowed {
            return Err(OscarError::NegotiationState("stage can only move forward"));
        }
        self.state = NegotiationState::for_stage(stage);
        self.deadline = deadline;
        self.attempt = self.attempt.wrapping_add(1);
        self.socket_live = false;
        Ok(self.attempt)
    }

    /// The transport socket for `attempt` is up. Returns `true` on
    /// reaching `Connected`.
    pub fn socket_live(&mut self, attempt: u32) -> Result<bool, OscarError> {
        if !self.is_current(attempt) {
            return Err(OscarError::NegotiationState("stale transport attempt"));
        }
        self.socket_live = true;
        Ok(self.try_connect())
    }

    /// An accept was sent or received. Returns `true` on reaching
    /// `Connected`.
    pub fn accepted(&mut self) -> Result<bool, OscarError> {
        if self.is_terminal() || self.state == NegotiationState::Connected {
            return Err(OscarError::NegotiationState("accept after negotiation settled"));
        }
        self.accepted = true;
        Ok(self.try_connect())
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    fn try_connect(&mut self) -> bool {
        if self.socket_live && self.accepted && self.stage().is_some() {
            self.state = NegotiationState::Connected;
            return true;
        }
        false
    }

    /// Valid from `Connected`, or from `Proposed` once accepted when the
    /// feature needs no transport.
    pub fn complete(&mut self) -> Result<(), OscarError> {
        match self.state {
            NegotiationState::Connected => {}
            NegotiationState::Proposed if self.accepted && !self.capability.needs_transport() => {}
            _ => return Err(OscarError::NegotiationState("nothing to complete")),
        }
        self.state = NegotiationState::Completed;
        Ok(())
    }

    /// Returns `false` when already cancelled.
    pub fn cancel(&mut self, reason: CancelReason) -> Result<bool, OscarError> {
        match self.state {
            NegotiationState::Cancelled(_) => Ok(false),
            NegotiationState::Completed | NegotiationState::Failed(_) => Err(
                OscarError::NegotiationState("cannot cancel a finished negotiation"),
            ),
            _ => {
                self.state = NegotiationState::Cancelled(reason);
                Ok(true)
            }
        }
    }

    pub fn fail(&mut self, failure: RendezvousFailure) -> Result<(), OscarError> {
        if self.is_terminal() {
            return Err(OscarError::NegotiationState("negotiation already finished"));
        }
        self.state = NegotiationState::Failed(failure);
        Ok(())
    }
}
