//! Message grammar of the bridge protocol.
//!
//! The exchange is lock-step:
//!
//! 1. On accept, the admin peer receives a [`Handshake`]
//! 2. The peer sends a command per environment ([`Command`])
//! 3. Once the environment finishes the action, a [`StateMessage`] goes back
//!
//! Multi-environment traffic carries an `ENV=<i>` field per message and
//! several messages are joined with [`MULTIPLEX_SEPARATOR`].

use std::fmt;

use rlbridge_core::{CodecError, EnvId, Topology};
use tracing::debug;

use crate::codec::{extract_tag, has_flag, strip_tag};

/// Joins several messages into one multi-environment batch.
pub const MULTIPLEX_SEPARATOR: &str = "||";

/// Prefix of the handshake record.
pub const HANDSHAKE_PREFIX: &str = "CONFIG:";

pub const TAG_ENV: &str = "ENV";
pub const TAG_ACT: &str = "ACT";
pub const TAG_OBS: &str = "OBS";
pub const TAG_REW: &str = "REW";
pub const TAG_DONE: &str = "DONE";

pub const RESET: &str = "RESET";
pub const TRAINING_COMPLETE: &str = "TRAINING_COMPLETE";

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// An inbound command from the training peer.
///
/// # Example
///
/// ```
/// use rlbridge_wire::protocol::Command;
///
/// assert_eq!(Command::parse("ENV=1;RESET"), Command::Reset);
/// assert_eq!(Command::parse("ACT=0.5,1.0"), Command::Act("0.5,1.0".into()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Return the environment to an initial state.
    Reset,
    /// Training is over: reset and disconnect.
    TrainingComplete,
    /// Apply an action. Holds the action text as sent.
    Act(String),
    /// Nothing usable in the message.
    Unknown(String),
}

impl Command {
    /// Parse one message. Any `ENV` field is ignored here.
    ///
    /// `RESET` and `TRAINING_COMPLETE` are accepted as bare fields or as the
    /// `ACT` value. A message without `ACT` is taken whole as the action.
    pub fn parse(message: &str) -> Self {
        let body = strip_tag(message, TAG_ENV);
        if body.is_empty() {
            return Self::Unknown(message.trim().to_string());
        }
        let act = extract_tag(&body, TAG_ACT);
        if has_flag(&body, TRAINING_COMPLETE) || act == Some(TRAINING_COMPLETE) {
            return Self::TrainingComplete;
        }
        if has_flag(&body, RESET) || act == Some(RESET) {
            return Self::Reset;
        }
        match act {
            Some("") => Self::Unknown(body),
            Some(action) => Self::Act(action.to_string()),
            None => Self::Act(body),
        }
    }

    pub const fn is_reset(&self) -> bool {
        matches!(self, Self::Reset)
    }
}

/// Environment id carried in a message's `ENV` field.
///
/// A missing or non-numeric tag is `None`.
pub fn env_tag(message: &str) -> Option<EnvId> {
    let raw = extract_tag(message, TAG_ENV)?;
    match raw.parse::<usize>() {
        Ok(index) => Some(EnvId(index)),
        Err(_) => {
            debug!(tag = raw, "non-numeric ENV tag");
            None
        }
    }
}

/// `message` carrying exactly one `ENV=<env>` field, replacing any other.
///
/// ```
/// use rlbridge_core::EnvId;
/// use rlbridge_wire::protocol::with_env_tag;
/// assert_eq!(with_env_tag("ENV=9;ACT=1", EnvId(2)), "ACT=1;ENV=2");
/// ```
pub fn with_env_tag(message: &str, env: EnvId) -> String {
    let body = strip_tag(message, TAG_ENV);
    if body.is_empty() {
        format!("{TAG_ENV}={env}")
    } else {
        format!("{body};{TAG_ENV}={env}")
    }
}

/// Split a multiplexed batch into its non-empty messages.
pub fn split_batch(batch: &str) -> impl Iterator<Item = &str> {
    batch
        .split(MULTIPLEX_SEPARATOR)
        .map(str::trim)
        .filter(|m| !m.is_empty())
}

/// Join messages into one multiplexed batch.
pub fn join_batch<S: AsRef<str>>(messages: &[S]) -> String {
    messages
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(MULTIPLEX_SEPARATOR)
}

// ---------------------------------------------------------------------------
// StateMessage
// ---------------------------------------------------------------------------

/// Observation, reward and done flag sent after an action completes.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMessage {
    /// Encoded observation, as produced by the environment.
    pub state: String,
    pub reward: f32,
    pub done: bool,
    /// Present on multi-environment traffic.
    pub env: Option<EnvId>,
}

impl StateMessage {
    pub fn new(state: impl Into<String>, reward: f32, done: bool) -> Self {
        Self {
            state: state.into(),
            reward,
            done,
            env: None,
        }
    }

    #[must_use]
    pub const fn for_env(mut self, env: EnvId) -> Self {
        self.env = Some(env);
        self
    }

    /// Parse a state message. Used on the peer side and in tests.
    pub fn parse(message: &str) -> Result<Self, CodecError> {
        let state = extract_tag(message, TAG_OBS).ok_or(CodecError::MissingTag(TAG_OBS))?;
        let reward_raw = extract_tag(message, TAG_REW).ok_or(CodecError::MissingTag(TAG_REW))?;
        let reward = reward_raw
            .parse::<f32>()
            .map_err(|_| CodecError::MalformedNumber {
                index: 0,
                segment: reward_raw.to_string(),
            })?;
        let done = extract_tag(message, TAG_DONE).ok_or(CodecError::MissingTag(TAG_DONE))? == "1";
        Ok(Self {
            state: state.to_string(),
            reward,
            done,
            env: env_tag(message),
        })
    }
}

/// `OBS=<state>;REW=<reward:.2>;DONE=<0|1>[;ENV=<i>]`
impl fmt::Display for StateMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TAG_OBS}={};{TAG_REW}={:.2};{TAG_DONE}={}",
            self.state,
            self.reward,
            u8::from(self.done)
        )?;
        if let Some(env) = self.env {
            write!(f, ";{TAG_ENV}={env}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Session parameters sent once to the admin peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub observation_size: usize,
    pub action_size: usize,
    pub topology: Topology,
    pub env_count: usize,
}

impl Handshake {
    pub const fn single(observation_size: usize, action_size: usize) -> Self {
        Self {
            observation_size,
            action_size,
            topology: Topology::Single,
            env_count: 1,
        }
    }

    pub const fn multi(observation_size: usize, action_size: usize, env_count: usize) -> Self {
        Self {
            observation_size,
            action_size,
            topology: Topology::Multi,
            env_count,
        }
    }

    /// Parse a handshake record.
    ///
    /// Missing `OBS`/`ACT` read as 0, a missing `ENV_TYPE` as single and a
    /// missing `ENV_COUNT` as 1. Any `ENV_TYPE` other than `MULTI` is single.
    ///
    /// ```
    /// use rlbridge_wire::protocol::Handshake;
    /// let hs = Handshake::parse("CONFIG:OBS=7;ACT=6;ENV_TYPE=MULTI;ENV_COUNT=3").unwrap();
    /// assert_eq!(hs, Handshake::multi(7, 6, 3));
    /// ```
    pub fn parse(message: &str) -> Result<Self, CodecError> {
        let body = message
            .trim()
            .strip_prefix(HANDSHAKE_PREFIX)
            .ok_or_else(|| CodecError::MalformedHandshake(message.to_string()))?;
        let int = |tag: &str, default: usize| -> Result<usize, CodecError> {
            extract_tag(body, tag).map_or(Ok(default), |raw| {
                raw.parse()
                    .map_err(|_| CodecError::MalformedHandshake(format!("{tag}={raw}")))
            })
        };
        let observation_size = int(TAG_OBS, 0)?;
        let action_size = int(TAG_ACT, 0)?;
        let multi = extract_tag(body, "ENV_TYPE")
            .is_some_and(|kind| kind.eq_ignore_ascii_case(Topology::Multi.as_wire()));
        if multi {
            Ok(Self::multi(observation_size, action_size, int("ENV_COUNT", 1)?))
        } else {
            Ok(Self::single(observation_size, action_size))
        }
    }
}

/// `CONFIG:OBS=<n>;ACT=<n>;ENV_TYPE=SINGLE` or
/// `CONFIG:OBS=<n>;ACT=<n>;ENV_TYPE=MULTI;ENV_COUNT=<n>`
impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{HANDSHAKE_PREFIX}{TAG_OBS}={};{TAG_ACT}={};ENV_TYPE={}",
            self.observation_size,
            self.action_size,
            self.topology.as_wire()
        )?;
        if self.topology == Topology::Multi {
            write!(f, ";ENV_COUNT={}", self.env_count)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
