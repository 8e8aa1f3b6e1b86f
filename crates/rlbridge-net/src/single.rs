//! Admin plus one environment connection.

use std::net::SocketAddr;
use std::time::Duration;

use rlbridge_core::{BridgeConfig, BridgeError, EnvChannel, EnvId, TransportError};
use rlbridge_wire::framing::frame;
use rlbridge_wire::protocol::Handshake;

use crate::pool::{PoolCore, PoolState};

/// Socket pool for a single environment.
///
/// The first accepted connection is the admin peer and receives the
/// handshake immediately; the second is the environment. Any further
/// connection is rejected.
pub struct SinglePool {
    core: PoolCore,
}

impl SinglePool {
    /// Create an unbound pool. The handshake declares the configured
    /// observation and action sizes.
    pub fn new(config: &BridgeConfig) -> Self {
        let mut config = config.clone();
        config.num_envs = 1;
        let handshake = Handshake::single(config.observation_size, config.action_size);
        Self {
            core: PoolCore::new(config, handshake),
        }
    }

    /// Validate the configuration, bind and start accepting. Returns the
    /// bound address.
    pub fn start(&mut self) -> Result<SocketAddr, BridgeError> {
        self.core.start()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    pub fn state(&self) -> PoolState {
        self.core.state()
    }

    pub fn handshake(&self) -> &Handshake {
        self.core.handshake()
    }

    pub fn is_accepting(&self) -> bool {
        self.core.is_accepting()
    }

    /// Block until admin and environment are connected, polling every `poll`.
    pub fn wait_until_connected(&self, timeout: Duration, poll: Duration) -> bool {
        self.core.wait_until_connected(timeout, poll)
    }

    pub fn send_to_environment(&self, message: &str) -> Result<(), TransportError> {
        let bytes = frame(message, &self.core.config.terminator);
        self.core.write_env(EnvId(0), &bytes).map_err(missing_env)
    }

    /// Read once and return at most one complete message, the earliest.
    pub fn receive_from_environment(&self) -> Result<Option<String>, TransportError> {
        self.core.receive_env_one(EnvId(0)).map_err(missing_env)
    }

    pub fn send_to_admin(&self, message: &str) -> Result<(), TransportError> {
        self.core.send_admin(message)
    }

    pub fn receive_from_admin(&self) -> Result<Option<String>, TransportError> {
        self.core.receive_admin()
    }

    /// Stop accepting and close every connection. Safe to call twice.
    pub fn close(&mut self) {
        self.core.close();
    }
}

fn missing_env(err: TransportError) -> TransportError {
    match err {
        TransportError::UnknownEnvironment(_) => TransportError::NotConnected("environment"),
        other => other,
    }
}

impl EnvChannel for SinglePool {
    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn send(&mut self, message: &str) -> Result<(), TransportError> {
        self.send_to_environment(message)
    }

    fn receive(&mut self) -> Result<Option<String>, TransportError> {
        self.receive_from_environment()
    }

    fn close(&mut self) {
        self.core.close();
    }
}
