//! TCP transport for rlbridge.
//!
//! - [`connection`]: [`Connection`], one peer stream with a role
//! - [`accept`]: [`AcceptWorker`], the background accept loop
//! - [`single`]: [`SinglePool`], admin plus one environment
//! - [`multi`]: [`MultiPool`], admin plus `N` multiplexed environments
//!
//! Both pools implement [`EnvChannel`](rlbridge_core::EnvChannel) so bridge
//! controllers can drive either.

pub mod accept;
pub mod connection;
pub mod multi;
mod pool;
pub mod single;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use accept::{AcceptOutcome, AcceptWorker, Acceptor};
pub use connection::{Connection, listen};
pub use multi::MultiPool;
pub use pool::PoolState;
pub use single::SinglePool;
