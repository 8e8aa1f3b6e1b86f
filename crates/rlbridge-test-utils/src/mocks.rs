//! Mock implementations of the core traits for testing.
//!
//! Mocks hand out a shared probe so a test can inspect them after moving the
//! mock into a controller.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rlbridge_core::{Environment, InferenceError, InferenceModel};

// ---------------------------------------------------------------------------
// RecordingEnvironment
// ---------------------------------------------------------------------------

/// One callback invocation seen by a [`RecordingEnvironment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateState,
    CalculateReward,
    Reset,
    Apply(String),
    IsRunning,
}

#[derive(Debug, Default)]
struct Recording {
    state: String,
    reward: f32,
    done: bool,
    busy_ticks: usize,
    remaining: usize,
    calls: Vec<Call>,
}

/// Environment that records every callback and reports scripted results.
///
/// After each action, `is_action_running` returns `true` for `busy_ticks`
/// calls, then `false`.
#[derive(Debug, Clone, Default)]
pub struct RecordingEnvironment {
    inner: Rc<RefCell<Recording>>,
}

impl RecordingEnvironment {
    pub fn new(state: impl Into<String>) -> Self {
        let env = Self::default();
        env.inner.borrow_mut().state = state.into();
        env
    }

    #[must_use]
    pub fn with_reward(self, reward: f32, done: bool) -> Self {
        {
            let mut rec = self.inner.borrow_mut();
            rec.reward = reward;
            rec.done = done;
        }
        self
    }

    #[must_use]
    pub fn with_busy_ticks(self, ticks: usize) -> Self {
        self.inner.borrow_mut().busy_ticks = ticks;
        self
    }

    /// A handle sharing this environment's recording.
    pub fn probe(&self) -> Self {
        self.clone()
    }

    pub fn set_state(&self, state: impl Into<String>) {
        self.inner.borrow_mut().state = state.into();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.borrow().calls.clone()
    }

    /// Action texts passed to `apply_action`, in order.
    pub fn actions(&self) -> Vec<String> {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Apply(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn reset_count(&self) -> usize {
        self.count(&Call::Reset)
    }

    pub fn reward_count(&self) -> usize {
        self.count(&Call::CalculateReward)
    }

    fn count(&self, call: &Call) -> usize {
        self.inner.borrow().calls.iter().filter(|c| *c == call).count()
    }
}

impl Environment for RecordingEnvironment {
    fn create_state(&mut self) -> String {
        let mut rec = self.inner.borrow_mut();
        rec.calls.push(Call::CreateState);
        rec.state.clone()
    }

    fn calculate_reward(&mut self) -> (f32, bool) {
        let mut rec = self.inner.borrow_mut();
        rec.calls.push(Call::CalculateReward);
        (rec.reward, rec.done)
    }

    fn handle_reset(&mut self) {
        self.inner.borrow_mut().calls.push(Call::Reset);
    }

    fn apply_action(&mut self, action: &str) {
        let mut rec = self.inner.borrow_mut();
        rec.calls.push(Call::Apply(action.to_string()));
        rec.remaining = rec.busy_ticks;
    }

    fn is_action_running(&mut self) -> bool {
        let mut rec = self.inner.borrow_mut();
        rec.calls.push(Call::IsRunning);
        if rec.remaining > 0 {
            rec.remaining -= 1;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedModel
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Script {
    outputs: VecDeque<String>,
    fallback: Option<String>,
    seen: Vec<Vec<f32>>,
}

/// Inference model returning scripted outputs and recording its inputs.
///
/// Outputs are consumed in order, then the fallback repeats. With neither
/// left, inference fails with a backend error.
#[derive(Debug, Clone, Default)]
pub struct ScriptedModel {
    inner: Rc<RefCell<Script>>,
}

impl ScriptedModel {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::default();
        model.inner.borrow_mut().outputs = outputs.into_iter().map(Into::into).collect();
        model
    }

    /// A model that always answers `output`.
    pub fn constant(output: impl Into<String>) -> Self {
        let model = Self::default();
        model.inner.borrow_mut().fallback = Some(output.into());
        model
    }

    pub fn probe(&self) -> Self {
        self.clone()
    }

    /// Observations passed to `run_inference`, in order.
    pub fn observations(&self) -> Vec<Vec<f32>> {
        self.inner.borrow().seen.clone()
    }
}

impl InferenceModel for ScriptedModel {
    fn run_inference(&mut self, observation: &[f32]) -> Result<String, InferenceError> {
        let mut script = self.inner.borrow_mut();
        script.seen.push(observation.to_vec());
        match script.outputs.pop_front() {
            Some(out) => Ok(out),
            None => script
                .fallback
                .clone()
                .ok_or_else(|| InferenceError::Backend("script exhausted".into())),
        }
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "ScriptedModel"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
