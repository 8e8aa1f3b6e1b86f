//! Text codec, terminator framing and message grammar for rlbridge.
//!
//! - [`codec`]: float vector encoding and `KEY=value` field access
//! - [`framing`]: terminator-delimited frames and [`FrameBuffer`] reassembly
//! - [`protocol`]: [`Command`], [`StateMessage`], [`Handshake`] and
//!   multi-environment batching
//!
//! Nothing here touches a socket.

pub mod codec;
pub mod framing;
pub mod protocol;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::{decode_vector, encode_vector, extract_tag, try_decode_vector};
pub use framing::{FrameBuffer, split_frames};
pub use protocol::{Command, Handshake, MULTIPLEX_SEPARATOR, StateMessage};

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        Command, FrameBuffer, Handshake, MULTIPLEX_SEPARATOR, StateMessage,
        codec::{append_field, append_value, decode_vector, encode_vector, extract_tag},
        framing::split_frames,
    };
}
