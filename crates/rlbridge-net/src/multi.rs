//! Admin plus `N` environment connections multiplexed over one channel.

use std::net::SocketAddr;
use std::time::Duration;

use rlbridge_core::{BridgeConfig, BridgeError, EnvChannel, EnvId, TransportError};
use rlbridge_wire::framing::frame;
use rlbridge_wire::protocol::{Handshake, env_tag, join_batch, split_batch, with_env_tag};
use tracing::{debug, warn};

use crate::pool::{PoolCore, PoolState};

/// Socket pool for `num_envs` environments.
///
/// Environment connections fill the first empty slot in acceptance order and
/// the slot index is the environment id. Accepting stops once every slot is
/// filled.
pub struct MultiPool {
    core: PoolCore,
}

impl MultiPool {
    pub fn new(config: &BridgeConfig) -> Self {
        let handshake = Handshake::multi(
            config.observation_size,
            config.action_size,
            config.num_envs,
        );
        Self {
            core: PoolCore::new(config.clone(), handshake),
        }
    }

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

    pub fn env_count(&self) -> usize {
        self.core.config.num_envs
    }

    /// Number of environment slots holding an open connection.
    pub fn connected_envs(&self) -> usize {
        self.core.connected_envs()
    }

    pub fn is_accepting(&self) -> bool {
        self.core.is_accepting()
    }

    pub fn wait_until_connected(&self, timeout: Duration, poll: Duration) -> bool {
        self.core.wait_until_connected(timeout, poll)
    }

    /// Send one message to the environment named by its `ENV` tag.
    pub fn send_message(&self, message: &str) -> Result<(), TransportError> {
        let env = route(message)?;
        self.core
            .write_env(env, &frame(message, &self.core.config.terminator))
    }

    /// Split a `||` batch and route every message by its `ENV` tag.
    ///
    /// Messages for the same slot are written together, one write per slot.
    /// Every routable message is sent; the first failure is returned.
    pub fn send_batch(&self, batch: &str) -> Result<(), TransportError> {
        let terminator = &self.core.config.terminator;
        let mut per_slot: Vec<Vec<u8>> = vec![Vec::new(); self.env_count()];
        let mut first_err = None;

        for message in split_batch(batch) {
            match route(message) {
                Ok(env) if env.index() < per_slot.len() => {
                    per_slot[env.index()].extend_from_slice(&frame(message, terminator));
                }
                Ok(env) => {
                    warn!(env_id = %env, "dropping message for unknown environment");
                    first_err.get_or_insert(TransportError::UnknownEnvironment(env.index()));
                }
                Err(err) => {
                    warn!("dropping unroutable message: {err}");
                    first_err.get_or_insert(err);
                }
            }
        }

        for (index, bytes) in per_slot.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            if let Err(err) = self.core.write_env(EnvId(index), bytes) {
                warn!(env_id = index, "send failed: {err}");
                first_err.get_or_insert(err);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Read every environment once and return all complete messages, each
    /// tagged `ENV=<slot>` and joined with `||`. `None` when nothing arrived.
    ///
    /// The slot a message arrived on wins over any `ENV` field the peer put
    /// in it.
    pub fn receive_messages(&self) -> Option<String> {
        let messages: Vec<String> = self
            .core
            .receive_env_all()
            .into_iter()
            .map(|(env, message)| {
                if let Some(claimed) = env_tag(&message).filter(|claimed| *claimed != env) {
                    debug!(env_id = %env, claimed = %claimed, "peer ENV tag replaced by slot");
                }
                with_env_tag(&message, env)
            })
            .collect();
        if messages.is_empty() {
            None
        } else {
            Some(join_batch(&messages))
        }
    }

    pub fn send_to_admin(&self, message: &str) -> Result<(), TransportError> {
        self.core.send_admin(message)
    }

    pub fn receive_from_admin(&self) -> Result<Option<String>, TransportError> {
        self.core.receive_admin()
    }

    pub fn close(&mut self) {
        self.core.close();
    }
}

fn route(message: &str) -> Result<EnvId, TransportError> {
    env_tag(message).ok_or_else(|| TransportError::MissingEnvTag(message.to_string()))
}

impl EnvChannel for MultiPool {
    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn send(&mut self, message: &str) -> Result<(), TransportError> {
        self.send_batch(message)
    }

    fn receive(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.receive_messages())
    }

    fn close(&mut self) {
        self.core.close();
    }
}
