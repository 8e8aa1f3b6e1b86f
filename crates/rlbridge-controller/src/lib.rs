//! Bridge controllers for rlbridge.
//!
//! - [`state_machine`]: [`StepMachine`], lock-step state of one environment
//! - [`single`]: [`SingleEnvBridge`], one environment behind one channel
//! - [`multi`]: [`MultiEnvBridge`], a bank of environments behind one
//!   multiplexed channel
//! - [`inference`]: [`LocalInference`], a local model standing in for the peer
//! - [`runtime`]: [`ModelCache`], process-wide shared models
//! - `onnx`: ONNX Runtime model (feature `onnx`)

pub mod inference;
pub mod multi;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod runtime;
pub mod single;
pub mod state_machine;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use inference::LocalInference;
pub use multi::MultiEnvBridge;
#[cfg(feature = "onnx")]
pub use onnx::{ActionTransform, OnnxModel, OnnxSession};
pub use runtime::ModelCache;
pub use single::SingleEnvBridge;
pub use state_machine::StepMachine;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

pub mod prelude {
    pub use crate::{LocalInference, ModelCache, MultiEnvBridge, SingleEnvBridge, StepMachine};

    pub use rlbridge_core::prelude::*;
}
