//! Local inference adapter.
//!
//! Stands in for the network peer: decodes an environment state string into
//! an observation vector and asks an [`InferenceModel`] for the next action.

use rlbridge_core::{BridgeConfig, InferenceError, InferenceModel};
use rlbridge_wire::codec::{decode_vector, extract_tag, try_decode_vector};
use rlbridge_wire::protocol::TAG_OBS;
use tracing::trace;

/// Wraps a model with the decoding rules of a bridge.
pub struct LocalInference {
    model: Box<dyn InferenceModel>,
    strict: bool,
    observation_size: Option<usize>,
}

impl LocalInference {
    /// Permissive decoding, no dimension check.
    pub fn new(model: Box<dyn InferenceModel>) -> Self {
        Self {
            model,
            strict: false,
            observation_size: None,
        }
    }

    /// Decoding rules taken from `config`.
    ///
    /// With `strict_decode` set, malformed numbers are errors and a non-zero
    /// `observation_size` is enforced.
    pub fn from_config(model: Box<dyn InferenceModel>, config: &BridgeConfig) -> Self {
        let observation_size =
            (config.strict_decode && config.observation_size > 0).then_some(config.observation_size);
        Self {
            model,
            strict: config.strict_decode,
            observation_size,
        }
    }

    #[must_use]
    pub const fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Require every decoded observation to have exactly `size` values.
    #[must_use]
    pub const fn with_observation_size(mut self, size: usize) -> Self {
        self.observation_size = Some(size);
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Decode `state` and run the model on it.
    ///
    /// `state` is either a bare float list or a message carrying `OBS=`.
    pub fn infer(&mut self, state: &str) -> Result<String, InferenceError> {
        let text = extract_tag(state, TAG_OBS).unwrap_or(state);
        let observation = if self.strict {
            try_decode_vector(text)?
        } else {
            decode_vector(text)
        };
        match self.observation_size {
            Some(expected) if observation.len() != expected => {
                return Err(InferenceError::ObservationDimMismatch {
                    expected,
                    got: observation.len(),
                });
            }
            _ => {}
        }
        let action = self.model.run_inference(&observation)?;
        trace!(model = self.model.name(), dim = observation.len(), %action, "inference");
        Ok(action)
    }
}

impl std::fmt::Debug for LocalInference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalInference")
            .field("model", &self.model.name())
            .field("strict", &self.strict)
            .field("observation_size", &self.observation_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
