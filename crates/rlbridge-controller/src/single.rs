//! Controller for one environment behind one channel.

use std::time::Instant;

use rlbridge_core::{
    BridgeConfig, BridgeMode, EnvChannel, EnvId, Environment, InferenceError, StepState,
    TickReport,
};
use rlbridge_wire::{Command, StateMessage};
use tracing::{debug, info, warn};

use crate::inference::LocalInference;
use crate::state_machine::StepMachine;

const ENV: EnvId = EnvId(0);

/// Drives one [`Environment`] in lock-step with a remote peer, or with a
/// local model in inference mode.
///
/// Call [`tick`](Self::tick) once per host frame. Nothing blocks.
pub struct SingleEnvBridge {
    config: BridgeConfig,
    channel: Box<dyn EnvChannel>,
    env: Box<dyn Environment>,
    inference: Option<LocalInference>,
    machine: StepMachine,
    mode: BridgeMode,
    unsent: Option<String>,
}

impl SingleEnvBridge {
    pub fn new(
        config: &BridgeConfig,
        channel: Box<dyn EnvChannel>,
        env: Box<dyn Environment>,
    ) -> Self {
        Self {
            config: config.clone(),
            channel,
            env,
            inference: None,
            machine: StepMachine::new(Instant::now()),
            mode: BridgeMode::Stopped,
            unsent: None,
        }
    }

    /// Attach a local model for inference mode.
    #[must_use]
    pub fn with_inference(mut self, inference: LocalInference) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn set_inference(&mut self, inference: LocalInference) {
        self.inference = Some(inference);
    }

    pub const fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub const fn step_state(&self) -> StepState {
        self.machine.state()
    }

    pub fn channel(&self) -> &dyn EnvChannel {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> &mut dyn EnvChannel {
        self.channel.as_mut()
    }

    pub fn start_training(&mut self) {
        self.machine = StepMachine::new(Instant::now());
        self.unsent = None;
        self.mode = BridgeMode::Training;
        info!("training started");
    }

    /// Switch to inference. Fails when no model is attached.
    pub fn start_inference(&mut self) -> Result<(), InferenceError> {
        let Some(inference) = &self.inference else {
            return Err(InferenceError::NoModel);
        };
        info!(model = inference.model_name(), "inference started");
        self.machine = StepMachine::new(Instant::now());
        self.mode = BridgeMode::Inference;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.mode != BridgeMode::Stopped {
            info!(mode = ?self.mode, "bridge stopped");
        }
        self.mode = BridgeMode::Stopped;
    }

    /// Advance one step.
    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// [`tick`](Self::tick) with an explicit clock, for stall detection.
    pub fn tick_at(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        match self.mode {
            BridgeMode::Stopped => {}
            BridgeMode::Training => self.tick_training(now, &mut report),
            BridgeMode::Inference => self.tick_inference(now, &mut report),
        }
        report
    }

    // -----------------------------------------------------------------------
    // Training
    // -----------------------------------------------------------------------

    fn tick_training(&mut self, now: Instant, report: &mut TickReport) {
        if !self.channel.is_connected() {
            return;
        }
        if !self.flush_unsent(report) {
            return;
        }

        if self.machine.is_idle() {
            match self.channel.receive() {
                Ok(Some(message)) => {
                    let command = Command::parse(&message);
                    if let Command::Unknown(text) = &command {
                        debug!(message = %text, "ignoring unrecognised command");
                    }
                    if let Some(command) = self.machine.offer(command, now) {
                        self.execute(command, now, report);
                        if self.mode != BridgeMode::Training {
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("receive failed: {err}"),
            }
        }

        if !self.machine.is_idle() && !self.env.is_action_running() {
            let (reward, done) = self.env.calculate_reward();
            let state = self.env.create_state();
            self.machine.finish_action(now);
            self.send(StateMessage::new(state, reward, done).to_string(), report);
        }

        if self.machine.check_stall(now, self.config.action_timeout()) {
            warn!(env_id = %ENV, "no command received within the action timeout");
            report.stalled.push(ENV);
        }
    }

    fn execute(&mut self, command: Command, now: Instant, report: &mut TickReport) {
        match command {
            Command::Reset => {
                self.env.handle_reset();
                self.machine.reset(now);
                report.resets.push(ENV);
                debug!(env_id = %ENV, "reset");
                if self.config.send_observation_on_reset {
                    let state = self.env.create_state();
                    self.send(StateMessage::new(state, 0.0, false).to_string(), report);
                }
            }
            Command::TrainingComplete => {
                self.env.handle_reset();
                self.machine.reset(now);
                report.resets.push(ENV);
                report.completed = true;
                self.channel.close();
                self.mode = BridgeMode::Stopped;
                info!("training complete, channel closed");
            }
            Command::Act(action) => {
                self.env.apply_action(&action);
                self.machine.start_action();
                report.applied.push(ENV);
            }
            Command::Unknown(_) => {}
        }
    }

    fn send(&mut self, message: String, report: &mut TickReport) {
        match self.channel.send(&message) {
            Ok(()) => report.sent.push(ENV),
            Err(err) => {
                warn!("send failed, retrying next tick: {err}");
                self.unsent = Some(message);
            }
        }
    }

    /// Retry an observation that failed to send. `false` while it still fails.
    fn flush_unsent(&mut self, report: &mut TickReport) -> bool {
        let Some(message) = self.unsent.take() else {
            return true;
        };
        self.send(message, report);
        self.unsent.is_none()
    }

    // -----------------------------------------------------------------------
    // Inference
    // -----------------------------------------------------------------------

    fn tick_inference(&mut self, now: Instant, report: &mut TickReport) {
        if !self.machine.is_idle() {
            if self.env.is_action_running() {
                return;
            }
            self.machine.finish_action(now);
        }

        let Some(inference) = self.inference.as_mut() else {
            return;
        };
        let state = self.env.create_state();
        match inference.infer(&state) {
            Ok(action) if action.is_empty() => debug!("model produced no action"),
            Ok(action) => {
                self.env.apply_action(&action);
                self.machine.start_action();
                report.applied.push(ENV);
            }
            Err(err) => warn!("inference failed: {err}"),
        }
    }
}

impl std::fmt::Debug for SingleEnvBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleEnvBridge")
            .field("mode", &self.mode)
            .field("machine", &self.machine)
            .field("inference", &self.inference)
            .field("unsent", &self.unsent)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
