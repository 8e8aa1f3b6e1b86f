//! ONNX model backed by ONNX Runtime.
//!
//! Requires the `onnx` feature flag.
//!
//! The model must expose an input named `obs` or `observation` shaped
//! `[1, obs_dim]` and an output named `action` or `actions` shaped
//! `[1, action_dim]`. Optional metadata selects an output transform:
//!
//! | key                | value                                  |
//! |--------------------|----------------------------------------|
//! | `action_transform` | `none`, `tanh` or `clip`               |
//! | `action_scale`     | JSON float array (tanh)                |
//! | `action_offset`    | JSON float array (tanh)                |
//! | `action_space`     | JSON object with `low` / `high` (clip) |
//! | `action_low`       | JSON float array (clip fallback)       |
//! | `action_high`      | JSON float array (clip fallback)       |

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use rlbridge_core::{InferenceError, InferenceModel};
use rlbridge_wire::encode_vector;
use tracing::{debug, info};

use crate::runtime::ModelCache;

const INPUT_NAMES: &[&str] = &["obs", "observation"];
const OUTPUT_NAMES: &[&str] = &["action", "actions"];

/// Decimals used when encoding actions.
pub const ACTION_PRECISION: usize = 2;

static SESSIONS: ModelCache<OnnxSession> = ModelCache::new();

// ---------------------------------------------------------------------------
// ActionTransform
// ---------------------------------------------------------------------------

/// Post-processing applied to raw model outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionTransform {
    None,
    /// `action[i] = raw[i] * scale[i] + offset[i]`.
    Tanh { scale: Vec<f32>, offset: Vec<f32> },
    /// Clamp to `[low[i], high[i]]`.
    Clip { low: Vec<f32>, high: Vec<f32> },
}

impl ActionTransform {
    /// Read the transform from model metadata. Unknown or absent values
    /// select [`ActionTransform::None`].
    pub fn from_metadata(metadata: &HashMap<String, String>, action_dim: usize) -> Self {
        let array = |key: &str| {
            metadata
                .get(key)
                .and_then(|s| serde_json::from_str::<Vec<f32>>(s).ok())
        };
        match metadata.get("action_transform").map(String::as_str) {
            Some("tanh") => Self::Tanh {
                scale: array("action_scale").unwrap_or_else(|| vec![1.0; action_dim]),
                offset: array("action_offset").unwrap_or_else(|| vec![0.0; action_dim]),
            },
            Some("clip") => {
                let space = metadata
                    .get("action_space")
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());
                let bound = |field: &str, key: &str| {
                    space
                        .as_ref()
                        .and_then(|v| v.get(field))
                        .and_then(|v| serde_json::from_value::<Vec<f32>>(v.clone()).ok())
                        .or_else(|| array(key))
                };
                Self::Clip {
                    low: bound("low", "action_low").unwrap_or_else(|| vec![-1.0; action_dim]),
                    high: bound("high", "action_high").unwrap_or_else(|| vec![1.0; action_dim]),
                }
            }
            _ => Self::None,
        }
    }

    /// Transform `raw` in place. Missing per-dimension entries leave that
    /// dimension unchanged.
    pub fn apply(&self, raw: &mut [f32]) {
        match self {
            Self::None => {}
            Self::Tanh { scale, offset } => {
                for (i, v) in raw.iter_mut().enumerate() {
                    *v = *v * scale.get(i).copied().unwrap_or(1.0)
                        + offset.get(i).copied().unwrap_or(0.0);
                }
            }
            Self::Clip { low, high } => {
                for (i, v) in raw.iter_mut().enumerate() {
                    let lo = low.get(i).copied().unwrap_or(f32::NEG_INFINITY);
                    let hi = high.get(i).copied().unwrap_or(f32::INFINITY);
                    *v = v.max(lo).min(hi);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OnnxSession
// ---------------------------------------------------------------------------

/// A loaded model. `Session::run` needs `&mut`, so the session sits behind a
/// [`Mutex`] and one loaded model can serve several bridges.
pub struct OnnxSession {
    session: Mutex<Session>,
    obs_dim: usize,
    action_dim: usize,
    transform: ActionTransform,
    input_name: String,
    output_name: String,
}

impl OnnxSession {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let session = Session::builder()
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| backend(format!("failed to load {}: {e}", path.display())))?;

        let input_name = find_tensor_name(session.inputs().iter().map(|i| i.name()), INPUT_NAMES)
            .ok_or_else(|| backend("no observation input (expected `obs` or `observation`)"))?;
        let output_name =
            find_tensor_name(session.outputs().iter().map(|o| o.name()), OUTPUT_NAMES)
                .ok_or_else(|| backend("no action output (expected `action` or `actions`)"))?;

        let obs_dim = tensor_width(
            session.inputs().iter().map(|i| (i.name(), i.dtype())),
            &input_name,
        )
        .ok_or_else(|| backend("observation width unknown; expected shape [batch, obs_dim]"))?;
        let action_dim = tensor_width(
            session.outputs().iter().map(|o| (o.name(), o.dtype())),
            &output_name,
        )
        .ok_or_else(|| backend("action width unknown; expected shape [batch, action_dim]"))?;

        let transform = ActionTransform::from_metadata(&read_metadata(&session), action_dim);
        info!(
            path = %path.display(),
            obs_dim,
            action_dim,
            ?transform,
            "onnx model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            obs_dim,
            action_dim,
            transform,
            input_name,
            output_name,
        })
    }

    pub const fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub const fn action_dim(&self) -> usize {
        self.action_dim
    }

    pub const fn transform(&self) -> &ActionTransform {
        &self.transform
    }

    /// One forward pass. The observation is zero-padded or truncated to the
    /// model's input width.
    pub fn run(&self, observation: &[f32]) -> Result<Vec<f32>, InferenceError> {
        if observation.len() != self.obs_dim {
            debug!(
                expected = self.obs_dim,
                got = observation.len(),
                "observation resized to model input"
            );
        }
        let input = fit_to_width(observation, self.obs_dim);
        let tensor = TensorRef::<f32>::from_array_view(([1_usize, self.obs_dim], &*input))
            .map_err(|e| backend(format!("input tensor: {e}")))?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![&self.input_name => tensor])
            .map_err(|e| backend(format!("run: {e}")))?;
        let (_shape, data) = outputs[&*self.output_name]
            .try_extract_tensor::<f32>()
            .map_err(|e| backend(format!("action tensor: {e}")))?;

        let mut action: Vec<f32> = data.iter().take(self.action_dim).copied().collect();
        self.transform.apply(&mut action);
        Ok(action)
    }
}

impl std::fmt::Debug for OnnxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSession")
            .field("obs_dim", &self.obs_dim)
            .field("action_dim", &self.action_dim)
            .field("transform", &self.transform)
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// OnnxModel
// ---------------------------------------------------------------------------

/// [`InferenceModel`] over a shared [`OnnxSession`].
///
/// Sessions are cached per path for the life of the process; call
/// [`release_sessions`] to drop them.
#[derive(Debug, Clone)]
pub struct OnnxModel {
    session: Arc<OnnxSession>,
    precision: usize,
}

impl OnnxModel {
    /// Load `path`, reusing an already loaded session for the same path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let key = path.to_string_lossy();
        let session = SESSIONS.get_or_try_init(&key, || OnnxSession::from_file(path))?;
        Ok(Self {
            session,
            precision: ACTION_PRECISION,
        })
    }

    #[must_use]
    pub const fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn session(&self) -> &OnnxSession {
        &self.session
    }
}

impl InferenceModel for OnnxModel {
    fn run_inference(&mut self, observation: &[f32]) -> Result<String, InferenceError> {
        let action = self.session.run(observation)?;
        Ok(encode_vector(&action, self.precision))
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "OnnxModel"
    }
}

/// Drop every cached session. Models already handed out keep theirs.
pub fn release_sessions() -> usize {
    SESSIONS.teardown()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn backend(message: impl Into<String>) -> InferenceError {
    InferenceError::Backend(message.into())
}

/// First candidate present among `names`.
fn find_tensor_name<'a>(names: impl Iterator<Item = &'a str>, candidates: &[&str]) -> Option<String> {
    let names: Vec<&str> = names.collect();
    candidates
        .iter()
        .find(|c| names.contains(*c))
        .map(|c| (*c).to_string())
}

/// Second dimension of the tensor called `name`, if static and positive.
fn tensor_width<'a>(
    mut tensors: impl Iterator<Item = (&'a str, &'a ValueType)>,
    name: &str,
) -> Option<usize> {
    let (_, dtype) = tensors.find(|(n, _)| *n == name)?;
    let ValueType::Tensor { shape, .. } = dtype else {
        return None;
    };
    shape
        .get(1)
        .and_then(|d| usize::try_from(*d).ok())
        .filter(|d| *d > 0)
}

fn fit_to_width(observation: &[f32], width: usize) -> Vec<f32> {
    let mut input = vec![0.0_f32; width];
    let n = observation.len().min(width);
    input[..n].copy_from_slice(&observation[..n]);
    input
}

fn read_metadata(session: &Session) -> HashMap<String, String> {
    let Ok(meta) = session.metadata() else {
        return HashMap::new();
    };
    let Ok(keys) = meta.custom_keys() else {
        return HashMap::new();
    };
    keys.into_iter()
        .filter_map(|key| meta.custom(&key).map(|value| (key, value)))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
