//! Controller for a bank of environments behind one multiplexed channel.

use std::time::Instant;

use rlbridge_core::{
    BridgeConfig, BridgeMode, EnvChannel, EnvId, InferenceError, MultiEnvironment, StepState,
    TickReport,
};
use rlbridge_wire::protocol::{env_tag, join_batch, split_batch};
use rlbridge_wire::{Command, StateMessage};
use tracing::{debug, info, warn};

use crate::inference::LocalInference;
use crate::state_machine::StepMachine;

/// Drives every environment of a [`MultiEnvironment`] with its own step
/// machine.
///
/// Each tick reads one `||` batch, routes every message by its `ENV` tag,
/// and answers with one batch holding the observation of each environment
/// that finished its action.
pub struct MultiEnvBridge {
    config: BridgeConfig,
    channel: Box<dyn EnvChannel>,
    envs: Box<dyn MultiEnvironment>,
    inference: Option<LocalInference>,
    machines: Vec<StepMachine>,
    mode: BridgeMode,
    outbox: Vec<(EnvId, String)>,
}

impl MultiEnvBridge {
    /// The environment count comes from `envs`.
    pub fn new(
        config: &BridgeConfig,
        channel: Box<dyn EnvChannel>,
        envs: Box<dyn MultiEnvironment>,
    ) -> Self {
        let count = envs.env_count();
        if count != config.num_envs {
            warn!(
                envs = count,
                configured = config.num_envs,
                "environment count differs from configuration"
            );
        }
        Self {
            config: config.clone(),
            channel,
            envs,
            inference: None,
            machines: fresh_machines(count, config.max_pending_actions),
            mode: BridgeMode::Stopped,
            outbox: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_inference(mut self, inference: LocalInference) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn set_inference(&mut self, inference: LocalInference) {
        self.inference = Some(inference);
    }

    pub fn env_count(&self) -> usize {
        self.machines.len()
    }

    pub const fn mode(&self) -> BridgeMode {
        self.mode
    }

    /// Step state of `env`, or `None` if out of range.
    pub fn step_state(&self, env: EnvId) -> Option<StepState> {
        self.machines.get(env.index()).map(StepMachine::state)
    }

    pub fn channel(&self) -> &dyn EnvChannel {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> &mut dyn EnvChannel {
        self.channel.as_mut()
    }

    pub fn start_training(&mut self) {
        self.machines = fresh_machines(self.envs.env_count(), self.config.max_pending_actions);
        self.outbox.clear();
        self.mode = BridgeMode::Training;
        info!(envs = self.machines.len(), "training started");
    }

    /// Switch to inference. Every environment runs the model independently.
    pub fn start_inference(&mut self) -> Result<(), InferenceError> {
        let Some(inference) = &self.inference else {
            return Err(InferenceError::NoModel);
        };
        info!(
            model = inference.model_name(),
            envs = self.machines.len(),
            "inference started"
        );
        self.machines = fresh_machines(self.envs.env_count(), self.config.max_pending_actions);
        self.mode = BridgeMode::Inference;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.mode != BridgeMode::Stopped {
            info!(mode = ?self.mode, "bridge stopped");
        }
        self.mode = BridgeMode::Stopped;
    }

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

        match self.channel.receive() {
            Ok(Some(batch)) => {
                if self.dispatch(&batch, now, report) {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => warn!("receive failed: {err}"),
        }

        for index in 0..self.machines.len() {
            let env = EnvId(index);
            if !self.machines[index].is_idle() && !self.envs.is_action_running(env) {
                let (reward, done) = self.envs.calculate_reward(env);
                let state = self.envs.create_state(env);
                self.machines[index].finish_action(now);
                let message = StateMessage::new(state, reward, done).for_env(env);
                self.outbox.push((env, message.to_string()));
            }
            // Queued actions start now and are polled from the next tick.
            if let Some(command) = self.machines[index].take_pending() {
                self.execute(env, command, now, report);
            }
        }

        self.flush(report);

        let timeout = self.config.action_timeout();
        for (index, machine) in self.machines.iter_mut().enumerate() {
            if machine.check_stall(now, timeout) {
                warn!(env_id = index, "no command received within the action timeout");
                report.stalled.push(EnvId(index));
            }
        }
    }

    /// Route each message of `batch`. Returns `true` if training completed.
    fn dispatch(&mut self, batch: &str, now: Instant, report: &mut TickReport) -> bool {
        let count = self.machines.len();
        for message in split_batch(batch) {
            let Some(env) = env_tag(message) else {
                warn!(%message, "message without a valid ENV tag dropped");
                continue;
            };
            let Some(machine) = self.machines.get_mut(env.index()) else {
                warn!(env_id = %env, envs = count, "message for unknown environment dropped");
                continue;
            };
            let command = Command::parse(message);
            if let Command::Unknown(text) = &command {
                debug!(env_id = %env, message = %text, "ignoring unrecognised command");
            }
            if let Some(command) = machine.offer(command, now) {
                if matches!(command, Command::TrainingComplete) {
                    self.complete(now, report);
                    return true;
                }
                self.execute(env, command, now, report);
            }
        }
        false
    }

    fn execute(&mut self, env: EnvId, command: Command, now: Instant, report: &mut TickReport) {
        match command {
            Command::Reset => {
                self.envs.handle_reset(env);
                self.machines[env.index()].reset(now);
                report.resets.push(env);
                debug!(env_id = %env, "reset");
                if self.config.send_observation_on_reset {
                    let state = self.envs.create_state(env);
                    let message = StateMessage::new(state, 0.0, false).for_env(env);
                    self.outbox.push((env, message.to_string()));
                }
            }
            Command::Act(action) => {
                self.envs.apply_action(env, &action);
                self.machines[env.index()].start_action();
                report.applied.push(env);
            }
            Command::TrainingComplete => self.complete(now, report),
            Command::Unknown(_) => {}
        }
    }

    /// Reset every environment, close the channel and stop.
    fn complete(&mut self, now: Instant, report: &mut TickReport) {
        for (index, machine) in self.machines.iter_mut().enumerate() {
            self.envs.handle_reset(EnvId(index));
            machine.reset(now);
            report.resets.push(EnvId(index));
        }
        self.outbox.clear();
        report.completed = true;
        self.channel.close();
        self.mode = BridgeMode::Stopped;
        info!("training complete, channel closed");
    }

    /// Send every queued observation as one batch.
    ///
    /// A failed batch is not retried: the channel delivers what it can route
    /// and only reports the first failure, so a resend would duplicate.
    fn flush(&mut self, report: &mut TickReport) {
        if self.outbox.is_empty() {
            return;
        }
        let (envs, messages): (Vec<EnvId>, Vec<String>) = self.outbox.drain(..).unzip();
        match self.channel.send(&join_batch(&messages)) {
            Ok(()) => report.sent.extend(envs),
            Err(err) => warn!(dropped = envs.len(), "batch send failed: {err}"),
        }
    }

    // -----------------------------------------------------------------------
    // Inference
    // -----------------------------------------------------------------------

    fn tick_inference(&mut self, now: Instant, report: &mut TickReport) {
        let Some(inference) = self.inference.as_mut() else {
            return;
        };
        for (index, machine) in self.machines.iter_mut().enumerate() {
            let env = EnvId(index);
            if !machine.is_idle() {
                if self.envs.is_action_running(env) {
                    continue;
                }
                machine.finish_action(now);
            }
            let state = self.envs.create_state(env);
            match inference.infer(&state) {
                Ok(action) if action.is_empty() => debug!(env_id = %env, "model produced no action"),
                Ok(action) => {
                    self.envs.apply_action(env, &action);
                    machine.start_action();
                    report.applied.push(env);
                }
                Err(err) => warn!(env_id = %env, "inference failed: {err}"),
            }
        }
    }
}

fn fresh_machines(count: usize, queue_limit: usize) -> Vec<StepMachine> {
    let now = Instant::now();
    (0..count)
        .map(|_| StepMachine::new(now).with_queue_limit(queue_limit))
        .collect()
}

impl std::fmt::Debug for MultiEnvBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEnvBridge")
            .field("mode", &self.mode)
            .field("machines", &self.machines)
            .field("inference", &self.inference)
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rlbridge_test_utils::{LoopbackChannel, RecordingEnvironment, ScriptedModel};

    use super::*;

    struct Harness {
        bridge: MultiEnvBridge,
        channel: LoopbackChannel,
        envs: Vec<RecordingEnvironment>,
    }

    fn harness(config: &BridgeConfig, envs: Vec<RecordingEnvironment>) -> Harness {
        let channel = LoopbackChannel::connected();
        let probes = envs.iter().map(RecordingEnvironment::probe).collect();
        let mut bridge = MultiEnvBridge::new(config, Box::new(channel.probe()), Box::new(envs));
        bridge.start_training();
        Harness {
            bridge,
            channel,
            envs: probes,
        }
    }

    fn two_envs(config: &BridgeConfig) -> Harness {
        harness(
            config,
            vec![
                RecordingEnvironment::new("0.10").with_reward(1.0, false),
                RecordingEnvironment::new("0.20"),
            ],
        )
    }

    fn config(num_envs: usize) -> BridgeConfig {
        BridgeConfig {
            num_envs,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn act_and_reset_in_one_batch() {
        let mut h = two_envs(&BridgeConfig {
            send_observation_on_reset: false,
            ..config(2)
        });
        h.channel.push_inbound("ENV=0;ACT=1.0,2.0||ENV=1;RESET");
        let report = h.bridge.tick();

        assert_eq!(h.envs[0].actions(), ["1.0,2.0"]);
        assert_eq!(h.envs[0].reset_count(), 0);
        assert_eq!(h.envs[1].reset_count(), 1);
        assert!(h.envs[1].actions().is_empty());
        assert_eq!(report.applied, [EnvId(0)]);
        assert_eq!(report.resets, [EnvId(1)]);
        assert_eq!(h.channel.take_sent(), ["OBS=0.10;REW=1.00;DONE=0;ENV=0"]);
        assert_eq!(h.bridge.step_state(EnvId(0)), Some(StepState::Idle));
        assert_eq!(h.bridge.step_state(EnvId(1)), Some(StepState::Idle));
    }

    #[test]
    fn busy_action_and_reset_in_one_batch() {
        let mut h = harness(
            &config(2),
            vec![
                RecordingEnvironment::new("0.10").with_busy_ticks(1),
                RecordingEnvironment::new("0.20"),
            ],
        );
        h.channel.push_inbound("ENV=0;ACT=1.0,2.0||ENV=1;RESET");
        let report = h.bridge.tick();

        assert_eq!(h.envs[0].actions(), ["1.0,2.0"]);
        assert_eq!(h.envs[1].reset_count(), 1);
        assert!(h.envs[1].actions().is_empty());
        assert_eq!(report.applied, [EnvId(0)]);
        assert_eq!(report.resets, [EnvId(1)]);
        assert_eq!(h.bridge.step_state(EnvId(0)), Some(StepState::ActionInFlight));
        assert_eq!(h.bridge.step_state(EnvId(1)), Some(StepState::Idle));
        // Only the reset environment answers this tick.
        assert_eq!(h.channel.take_sent(), ["OBS=0.20;REW=0.00;DONE=0;ENV=1"]);

        h.bridge.tick();
        assert_eq!(h.channel.take_sent(), ["OBS=0.10;REW=0.00;DONE=0;ENV=0"]);
        assert_eq!(h.bridge.step_state(EnvId(0)), Some(StepState::Idle));
    }

    #[test]
    fn reset_observations_join_the_same_batch() {
        let mut h = two_envs(&config(2));
        h.channel.push_inbound("ENV=0;ACT=1.0,2.0||ENV=1;RESET");
        let report = h.bridge.tick();
        assert_eq!(report.sent, [EnvId(1), EnvId(0)]);
        assert_eq!(
            h.channel.take_sent(),
            ["OBS=0.20;REW=0.00;DONE=0;ENV=1||OBS=0.10;REW=1.00;DONE=0;ENV=0"]
        );
    }

    #[test]
    fn busy_environment_only_reports_when_done() {
        let mut h = harness(
            &config(2),
            vec![
                RecordingEnvironment::new("a").with_busy_ticks(1),
                RecordingEnvironment::new("b"),
            ],
        );
        h.channel.push_inbound("ENV=0;ACT=1||ENV=1;ACT=2");
        h.bridge.tick();
        assert_eq!(h.channel.take_sent(), ["OBS=b;REW=0.00;DONE=0;ENV=1"]);
        assert_eq!(h.bridge.step_state(EnvId(0)), Some(StepState::ActionInFlight));

        h.bridge.tick();
        assert_eq!(h.channel.take_sent(), ["OBS=a;REW=0.00;DONE=0;ENV=0"]);
    }

    #[test]
    fn action_for_busy_environment_is_queued() {
        let mut h = harness(&config(1), vec![RecordingEnvironment::new("x").with_busy_ticks(2)]);
        h.channel.push_inbound("ENV=0;ACT=1");
        h.bridge.tick();
        h.channel.push_inbound("ENV=0;ACT=2");
        h.bridge.tick();
        assert_eq!(h.envs[0].actions(), ["1"]);

        // First action finishes, queued one starts in the same tick.
        let report = h.bridge.tick();
        assert_eq!(report.sent, [EnvId(0)]);
        assert_eq!(report.applied, [EnvId(0)]);
        assert_eq!(h.envs[0].actions(), ["1", "2"]);
    }

    #[test]
    fn queue_limit_drops_excess_actions() {
        let mut h = harness(
            &BridgeConfig {
                max_pending_actions: 1,
                ..config(1)
            },
            vec![RecordingEnvironment::new("x").with_busy_ticks(5)],
        );
        h.channel.push_inbound("ENV=0;ACT=1||ENV=0;ACT=2||ENV=0;ACT=3");
        h.bridge.tick();
        assert_eq!(h.envs[0].actions(), ["1"]);
        assert_eq!(h.bridge.machines[0].pending(), 1);
        assert_eq!(h.bridge.machines[0].dropped(), 1);
    }

    #[test]
    fn untagged_and_unknown_messages_are_dropped() {
        let mut h = two_envs(&config(2));
        h.channel.push_inbound("ACT=1||ENV=7;ACT=1||ENV=x;RESET||ENV=1;ACT=3");
        let report = h.bridge.tick();
        assert_eq!(report.applied, [EnvId(1)]);
        assert!(h.envs[0].calls().is_empty());
        assert_eq!(h.envs[1].actions(), ["3"]);
    }

    #[test]
    fn training_complete_stops_everything() {
        let mut h = two_envs(&config(2));
        h.channel.push_inbound("ENV=1;TRAINING_COMPLETE||ENV=0;ACT=1");
        let report = h.bridge.tick();
        assert!(report.completed);
        assert_eq!(report.resets, [EnvId(0), EnvId(1)]);
        assert!(h.envs[0].actions().is_empty());
        assert!(h.channel.is_closed());
        assert!(h.channel.sent().is_empty());
        assert_eq!(h.bridge.mode(), BridgeMode::Stopped);
    }

    #[test]
    fn failed_batch_is_not_resent() {
        let mut h = two_envs(&config(2));
        h.channel.fail_next_sends(1);
        h.channel.push_inbound("ENV=0;ACT=1");
        assert!(h.bridge.tick().sent.is_empty());
        h.channel.push_inbound("ENV=1;ACT=2");
        let report = h.bridge.tick();
        assert_eq!(report.sent, [EnvId(1)]);
        assert_eq!(h.channel.take_sent(), ["OBS=0.20;REW=0.00;DONE=0;ENV=1"]);
        assert_eq!(h.bridge.step_state(EnvId(0)), Some(StepState::Idle));
    }

    #[test]
    fn stalls_reported_per_environment() {
        let mut h = two_envs(&BridgeConfig {
            action_timeout_ms: Some(10),
            ..config(2)
        });
        let t0 = Instant::now() + Duration::from_secs(1);
        h.channel.push_inbound("ENV=0;ACT=1");
        let report = h.bridge.tick_at(t0);
        // Env 0 just answered; env 1 has waited since start.
        assert_eq!(report.stalled, [EnvId(1)]);
        let later = h.bridge.tick_at(t0 + Duration::from_millis(50));
        assert_eq!(later.stalled, [EnvId(0)]);
    }

    #[test]
    fn inference_runs_every_environment() {
        let model = ScriptedModel::constant("0.5");
        let probe = model.probe();
        let envs = vec![RecordingEnvironment::new("1"), RecordingEnvironment::new("2")];
        let env_probes: Vec<_> = envs.iter().map(RecordingEnvironment::probe).collect();
        let mut bridge = MultiEnvBridge::new(
            &config(2),
            Box::new(LoopbackChannel::default()),
            Box::new(envs),
        )
        .with_inference(LocalInference::new(Box::new(model)));
        bridge.start_inference().unwrap();

        let report = bridge.tick();
        assert_eq!(report.applied, [EnvId(0), EnvId(1)]);
        assert_eq!(probe.observations(), vec![vec![1.0], vec![2.0]]);
        assert_eq!(env_probes[1].actions(), ["0.5"]);
    }

    #[test]
    fn stopped_bridge_ignores_input() {
        let mut h = two_envs(&config(2));
        h.bridge.stop();
        h.channel.push_inbound("ENV=0;ACT=1");
        assert!(h.bridge.tick().is_empty());
        assert_eq!(h.channel.pending_inbound(), 1);
    }
}
