use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EnvId
// ---------------------------------------------------------------------------

/// Environment identifier.
///
/// Equal to the environment's slot index in the socket pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvId(pub usize);

impl EnvId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for EnvId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Role assigned to an accepted peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First accepted connection; receives the handshake.
    Admin,
    /// One simulated environment instance.
    Environment(EnvId),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::Environment(id) => write!(f, "env#{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Environment topology declared in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Single,
    Multi,
}

impl Topology {
    /// Wire spelling used in `ENV_TYPE=`.
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Multi => "MULTI",
        }
    }
}

// ---------------------------------------------------------------------------
// StepState
// ---------------------------------------------------------------------------

/// Per-environment lock-step state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepState {
    /// Ready for a new command from the peer.
    #[default]
    Idle,
    /// An action has been applied and is still being carried out.
    ActionInFlight,
}

// ---------------------------------------------------------------------------
// BridgeMode
// ---------------------------------------------------------------------------

/// What drives actions for a bridge controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeMode {
    /// Ticks are ignored.
    #[default]
    Stopped,
    /// Actions come from the remote peer.
    Training,
    /// Actions come from the local inference adapter.
    Inference,
}

// ---------------------------------------------------------------------------
// Terminator
// ---------------------------------------------------------------------------

/// Message terminator appended after every frame.
///
/// One terminator is used per pool, for both directions and both roles.
///
/// In TOML: `terminator = "newline"` or `terminator = { token = "STEP" }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    #[default]
    Newline,
    Token(String),
}

impl Terminator {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Newline => "\n",
            Self::Token(token) => token,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.as_str().as_bytes()
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Newline => f.write_str("\\n"),
            Self::Token(token) => f.write_str(token),
        }
    }
}

// ---------------------------------------------------------------------------
// TickReport
// ---------------------------------------------------------------------------

/// What a single controller tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Environments whose apply-action callback ran this tick.
    pub applied: Vec<EnvId>,
    /// Environments reset this tick.
    pub resets: Vec<EnvId>,
    /// Environments whose observation went out this tick.
    pub sent: Vec<EnvId>,
    /// Environments newly reported as stalled this tick.
    pub stalled: Vec<EnvId>,
    /// The peer ended training and the controller tore down its connection.
    pub completed: bool,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
            && self.resets.is_empty()
            && self.sent.is_empty()
            && self.stalled.is_empty()
            && !self.completed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
