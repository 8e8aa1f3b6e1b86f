//! Point-mass environment served by `rlbridge serve`.
//!
//! The state is a position vector. An action is a displacement, applied over
//! a few ticks. Reward is the negative distance to the origin; an episode
//! ends at the origin or after `max_steps` actions.

use rlbridge_core::Environment;
use rlbridge_wire::codec::{append_field, decode_vector};

const GOAL_RADIUS: f32 = 0.05;

#[derive(Debug, Clone)]
pub struct PointMass {
    start: Vec<f32>,
    position: Vec<f32>,
    precision: usize,
    action_ticks: u32,
    busy: u32,
    max_steps: u32,
    steps: u32,
}

impl PointMass {
    pub fn new(dim: usize, precision: usize, action_ticks: u32, max_steps: u32) -> Self {
        let start: Vec<f32> = (0..dim.max(1))
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        Self {
            position: start.clone(),
            start,
            precision,
            action_ticks,
            busy: 0,
            max_steps,
            steps: 0,
        }
    }

    fn distance(&self) -> f32 {
        self.position.iter().map(|p| p * p).sum::<f32>().sqrt()
    }
}

impl Environment for PointMass {
    fn create_state(&mut self) -> String {
        let mut state = String::new();
        append_field(&mut state, &self.position, self.precision);
        state
    }

    fn calculate_reward(&mut self) -> (f32, bool) {
        let distance = self.distance();
        (-distance, distance < GOAL_RADIUS || self.steps >= self.max_steps)
    }

    fn handle_reset(&mut self) {
        self.position.clone_from(&self.start);
        self.steps = 0;
        self.busy = 0;
    }

    fn apply_action(&mut self, action: &str) {
        for (p, d) in self.position.iter_mut().zip(decode_vector(action)) {
            *p += d.clamp(-1.0, 1.0);
        }
        self.steps += 1;
        self.busy = self.action_ticks;
    }

    fn is_action_running(&mut self) -> bool {
        if self.busy == 0 {
            return false;
        }
        self.busy -= 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_moves_and_reward_tracks_distance() {
        let mut env = PointMass::new(2, 2, 0, 10);
        assert_eq!(env.create_state(), "1.00,-1.00");
        env.apply_action("-1.0,1.0");
        assert!(!env.is_action_running());
        assert_eq!(env.create_state(), "0.00,0.00");
        let (reward, done) = env.calculate_reward();
        assert!(reward.abs() < 1e-6);
        assert!(done);
    }

    #[test]
    fn action_takes_configured_ticks() {
        let mut env = PointMass::new(1, 2, 2, 10);
        env.apply_action("0.1");
        assert!(env.is_action_running());
        assert!(env.is_action_running());
        assert!(!env.is_action_running());
    }

    #[test]
    fn episode_ends_after_max_steps() {
        let mut env = PointMass::new(1, 2, 0, 2);
        env.apply_action("0");
        assert!(!env.calculate_reward().1);
        env.apply_action("0");
        assert!(env.calculate_reward().1);
        env.handle_reset();
        assert!(!env.calculate_reward().1);
        assert_eq!(env.create_state(), "1.00");
    }
}
