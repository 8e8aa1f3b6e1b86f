//! Shared test fixtures and utilities for rlbridge crates.
//!
//! Provides recording environments, scripted inference models, an in-memory
//! channel, a blocking TCP peer and deterministic RNG setup.

pub mod channel;
pub mod mocks;
pub mod peer;
pub mod rng;

// ---------------------------------------------------------------------------
// Re-exports for convenience
// ---------------------------------------------------------------------------

pub use channel::LoopbackChannel;
pub use mocks::{Call, RecordingEnvironment, ScriptedModel};
pub use peer::TestPeer;
pub use rng::seeded_rng;
