//! Per-environment lock-step state machine.
//!
//! ```text
//!            RESET / TRAINING_COMPLETE
//!          +-------------------------+
//!          v                         |
//!   +------------+   ACT    +----------------+
//!   |    Idle    | -------> | ActionInFlight |
//!   +------------+          +----------------+
//!          ^    action done (observation sent)  |
//!          +------------------------------------+
//! ```
//!
//! An action that arrives while another is in flight is queued and started
//! once the environment is idle again, up to a queue limit. Resets preempt
//! and drop the queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rlbridge_core::StepState;
use rlbridge_wire::Command;
use tracing::warn;

/// Lock-step state of one environment.
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use rlbridge_controller::state_machine::StepMachine;
/// use rlbridge_core::StepState;
/// use rlbridge_wire::Command;
///
/// let mut sm = StepMachine::new(Instant::now());
/// let cmd = sm.offer(Command::Act("1.0".into()), Instant::now());
/// assert_eq!(cmd, Some(Command::Act("1.0".into())));
/// sm.start_action();
/// assert_eq!(sm.state(), StepState::ActionInFlight);
/// ```
#[derive(Debug, Clone)]
pub struct StepMachine {
    state: StepState,
    pending: VecDeque<Command>,
    queue_limit: usize,
    dropped: usize,
    waiting_since: Option<Instant>,
    stall_reported: bool,
}

impl StepMachine {
    /// An idle machine waiting for its first command since `now`.
    #[must_use]
    pub const fn new(now: Instant) -> Self {
        Self {
            state: StepState::Idle,
            pending: VecDeque::new(),
            queue_limit: usize::MAX,
            dropped: 0,
            waiting_since: Some(now),
            stall_reported: false,
        }
    }

    /// Queue at most `limit` actions; further ones are dropped.
    #[must_use]
    pub const fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    #[must_use]
    pub const fn state(&self) -> StepState {
        self.state
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == StepState::Idle
    }

    /// Number of queued actions.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Actions dropped because the queue was full.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }

    /// Offer an inbound command. Returns the command if it should run now.
    ///
    /// Resets always run now and clear the queue. Actions run now only when
    /// idle with nothing queued; otherwise they are queued, or dropped once
    /// the queue is full. Unknown commands are dropped.
    pub fn offer(&mut self, command: Command, now: Instant) -> Option<Command> {
        match command {
            Command::Unknown(_) => None,
            Command::Reset | Command::TrainingComplete => {
                self.pending.clear();
                self.state = StepState::Idle;
                self.command_received();
                Some(command)
            }
            Command::Act(_) if self.is_idle() && self.pending.is_empty() => {
                self.command_received();
                Some(command)
            }
            Command::Act(_) if self.pending.len() >= self.queue_limit => {
                self.dropped += 1;
                warn!(
                    queued = self.pending.len(),
                    dropped = self.dropped,
                    "action queue full, dropping action"
                );
                None
            }
            Command::Act(_) => {
                self.pending.push_back(command);
                if self.waiting_since.is_none() {
                    self.waiting_since = Some(now);
                }
                None
            }
        }
    }

    /// Next queued action, if idle.
    pub fn take_pending(&mut self) -> Option<Command> {
        if !self.is_idle() {
            return None;
        }
        let command = self.pending.pop_front()?;
        self.command_received();
        Some(command)
    }

    /// An action was applied to the environment.
    pub fn start_action(&mut self) {
        self.state = StepState::ActionInFlight;
        self.waiting_since = None;
    }

    /// The environment finished its action; wait for the next command.
    pub fn finish_action(&mut self, now: Instant) {
        self.state = StepState::Idle;
        self.waiting_since = Some(now);
        self.stall_reported = false;
    }

    /// The environment was reset; wait for the next command.
    pub fn reset(&mut self, now: Instant) {
        self.pending.clear();
        self.finish_action(now);
    }

    /// Whether the machine has waited on its peer longer than `timeout`.
    ///
    /// Reports each stall once; a new command clears it.
    pub fn check_stall(&mut self, now: Instant, timeout: Option<Duration>) -> bool {
        let (Some(timeout), Some(since)) = (timeout, self.waiting_since) else {
            return false;
        };
        if self.stall_reported || !self.is_idle() {
            return false;
        }
        if now.saturating_duration_since(since) > timeout {
            self.stall_reported = true;
            return true;
        }
        false
    }

    fn command_received(&mut self) {
        self.waiting_since = None;
        self.stall_reported = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
