//! Shared types, capability traits, configuration and errors for rlbridge.
//!
//! - [`types`]: environment ids, roles, step states, terminators
//! - [`traits`]: [`Environment`], [`MultiEnvironment`], [`InferenceModel`]
//!   and the [`EnvChannel`] transport seam
//! - [`config`]: [`BridgeConfig`] loaded from TOML
//! - [`error`]: error taxonomy

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use config::BridgeConfig;
pub use error::{BridgeError, CodecError, ConfigError, InferenceError, TransportError};
pub use traits::{EnvChannel, Environment, InferenceModel, MultiEnvironment};
pub use types::{BridgeMode, EnvId, Role, StepState, Terminator, TickReport, Topology};

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        BridgeConfig, BridgeError, BridgeMode, CodecError, ConfigError, EnvChannel, EnvId,
        Environment, InferenceError, InferenceModel, MultiEnvironment, Role, StepState, Terminator,
        TickReport, Topology, TransportError,
    };
}
