use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Terminator;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

fn default_address() -> String {
    "127.0.0.1".into()
}
const fn default_port() -> u16 {
    5555
}
const fn default_num_envs() -> usize {
    1
}
const fn default_precision() -> usize {
    2
}
const fn default_recv_buffer_size() -> usize {
    1024
}
const fn default_accept_poll_ms() -> u64 {
    100
}
const fn default_join_timeout_ms() -> u64 {
    1000
}
const fn default_write_timeout_ms() -> u64 {
    1000
}
const fn default_max_frame_bytes() -> usize {
    64 * 1024
}
const fn default_max_pending_actions() -> usize {
    64
}
const fn default_true() -> bool {
    true
}

/// Largest number of decimals `precision` accepts.
pub const MAX_PRECISION: usize = 9;

// ---------------------------------------------------------------------------
// BridgeConfig
// ---------------------------------------------------------------------------

/// Bridge configuration shared by the socket pools and controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Address the listener binds to (default: `127.0.0.1`).
    #[serde(default = "default_address")]
    pub address: String,

    /// Listening port (default: 5555). Port 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of environment slots (default: 1).
    #[serde(default = "default_num_envs")]
    pub num_envs: usize,

    /// Observation vector width announced in the handshake.
    #[serde(default)]
    pub observation_size: usize,

    /// Action vector width announced in the handshake.
    #[serde(default)]
    pub action_size: usize,

    /// Message terminator used in both directions.
    #[serde(default)]
    pub terminator: Terminator,

    /// Decimals used when encoding float vectors (default: 2).
    #[serde(default = "default_precision")]
    pub precision: usize,

    /// Bytes requested per socket read (default: 1024).
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Accept worker polling interval in milliseconds (default: 100).
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,

    /// Upper bound on joining the accept worker at teardown (default: 1000).
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Upper bound on one blocking socket write in milliseconds
    /// (default: 1000).
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Longest unterminated frame kept per connection before it is dropped
    /// (default: 64 KiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Actions queued per busy environment before new ones are dropped
    /// (default: 64).
    #[serde(default = "default_max_pending_actions")]
    pub max_pending_actions: usize,

    /// Report environments waiting longer than this for a command.
    /// `None` waits forever.
    #[serde(default)]
    pub action_timeout_ms: Option<u64>,

    /// Answer `RESET` with a fresh observation (default: true).
    #[serde(default = "default_true")]
    pub send_observation_on_reset: bool,

    /// Reject malformed observation numbers on the inference path instead
    /// of reading them as zero.
    #[serde(default)]
    pub strict_decode: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            num_envs: default_num_envs(),
            observation_size: 0,
            action_size: 0,
            terminator: Terminator::default(),
            precision: default_precision(),
            recv_buffer_size: default_recv_buffer_size(),
            accept_poll_ms: default_accept_poll_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            max_pending_actions: default_max_pending_actions(),
            action_timeout_ms: None,
            send_observation_on_reset: true,
            strict_decode: false,
        }
    }
}

impl BridgeConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_envs == 0 {
            return Err(ConfigError::invalid("num_envs", "must be at least 1"));
        }
        if let Terminator::Token(token) = &self.terminator {
            if token.is_empty() {
                return Err(ConfigError::invalid("terminator", "token must not be empty"));
            }
        }
        if self.precision > MAX_PRECISION {
            return Err(ConfigError::invalid(
                "precision",
                format!("must be at most {MAX_PRECISION}, got {}", self.precision),
            ));
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::invalid("recv_buffer_size", "must be positive"));
        }
        if self.accept_poll_ms == 0 {
            return Err(ConfigError::invalid("accept_poll_ms", "must be positive"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::invalid("write_timeout_ms", "must be positive"));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::invalid("max_frame_bytes", "must be positive"));
        }
        if self.max_pending_actions == 0 {
            return Err(ConfigError::invalid("max_pending_actions", "must be positive"));
        }
        Ok(())
    }

    pub const fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_ms.map(Duration::from_millis)
    }

    /// `address:port` as a display string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
