use crate::error::{InferenceError, TransportError};
use crate::types::EnvId;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Callbacks a single simulated environment exposes to a bridge controller.
///
/// All methods are called from the foreground tick loop.
pub trait Environment {
    /// Encode the current observation as a state string, typically a
    /// comma-separated float list.
    fn create_state(&mut self) -> String;

    /// Reward for the action just completed and whether the episode ended.
    fn calculate_reward(&mut self) -> (f32, bool);

    /// Return the environment to an initial state.
    fn handle_reset(&mut self);

    /// Begin carrying out an action. `action` is the raw command text.
    fn apply_action(&mut self, action: &str);

    /// Whether the last applied action is still in progress.
    fn is_action_running(&mut self) -> bool;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn create_state(&mut self) -> String {
        (**self).create_state()
    }
    fn calculate_reward(&mut self) -> (f32, bool) {
        (**self).calculate_reward()
    }
    fn handle_reset(&mut self) {
        (**self).handle_reset();
    }
    fn apply_action(&mut self, action: &str) {
        (**self).apply_action(action);
    }
    fn is_action_running(&mut self) -> bool {
        (**self).is_action_running()
    }
}

// ---------------------------------------------------------------------------
// MultiEnvironment
// ---------------------------------------------------------------------------

/// Indexed form of [`Environment`] for a bank of environments.
pub trait MultiEnvironment {
    /// Number of environments in the bank.
    fn env_count(&self) -> usize;

    fn create_state(&mut self, env: EnvId) -> String;
    fn calculate_reward(&mut self, env: EnvId) -> (f32, bool);
    fn handle_reset(&mut self, env: EnvId);
    fn apply_action(&mut self, env: EnvId, action: &str);
    fn is_action_running(&mut self, env: EnvId) -> bool;
}

/// A vector of environments is a bank indexed by slot.
///
/// Panics on an out-of-range id; controllers never pass one.
impl<E: Environment> MultiEnvironment for Vec<E> {
    fn env_count(&self) -> usize {
        self.len()
    }
    fn create_state(&mut self, env: EnvId) -> String {
        self[env.index()].create_state()
    }
    fn calculate_reward(&mut self, env: EnvId) -> (f32, bool) {
        self[env.index()].calculate_reward()
    }
    fn handle_reset(&mut self, env: EnvId) {
        self[env.index()].handle_reset();
    }
    fn apply_action(&mut self, env: EnvId, action: &str) {
        self[env.index()].apply_action(action);
    }
    fn is_action_running(&mut self, env: EnvId) -> bool {
        self[env.index()].is_action_running()
    }
}

// ---------------------------------------------------------------------------
// InferenceModel
// ---------------------------------------------------------------------------

/// A local policy producing action text from an observation vector.
pub trait InferenceModel {
    /// Run one forward pass. The returned text is handed to
    /// [`Environment::apply_action`] unchanged.
    fn run_inference(&mut self, observation: &[f32]) -> Result<String, InferenceError>;

    /// Human-readable name for this model.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

// ---------------------------------------------------------------------------
// EnvChannel
// ---------------------------------------------------------------------------

/// Text transport between a bridge controller and its remote peer.
///
/// Implemented by the socket pools and by in-memory test channels. `send`
/// takes one outbound message (or a `||` batch for multi pools) without the
/// terminator; `receive` yields whatever complete input is available, or
/// `None` when nothing is pending.
pub trait EnvChannel {
    fn is_connected(&self) -> bool;
    fn send(&mut self, message: &str) -> Result<(), TransportError>;
    fn receive(&mut self) -> Result<Option<String>, TransportError>;
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
