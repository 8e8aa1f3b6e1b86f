use thiserror::Error;

/// Top-level error type for rlbridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Socket-level failures.
///
/// These are never fatal: callers log them and retry on the next tick.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("No {0} connection")]
    NotConnected(&'static str),

    #[error("Message has no ENV tag: {0}")]
    MissingEnvTag(String),

    #[error("Environment {0} is out of range or not connected")]
    UnknownEnvironment(usize),

    #[error("Socket pool is closed")]
    PoolClosed,

    #[error("Write timed out before any byte was sent")]
    WriteTimeout,

    #[error("Write timed out after {written} of {total} bytes; connection closed")]
    PartialWrite { written: usize, total: usize },

    #[error("Frame exceeds {limit} bytes without a terminator; {len} bytes dropped")]
    FrameTooLong { len: usize, limit: usize },
}

/// Wire decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Malformed number {segment:?} at position {index}")]
    MalformedNumber { index: usize, segment: String },

    #[error("Missing tag {0}")]
    MissingTag(&'static str),

    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),
}

/// Local inference errors.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("No inference model set")]
    NoModel,

    #[error("Observation dimension mismatch: model expects {expected}, got {got}")]
    ObservationDimMismatch { expected: usize, got: usize },

    #[error("Malformed observation: {0}")]
    Codec(#[from] CodecError),

    #[error("Inference backend failed: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_error_from_transport_error() {
        let err: BridgeError = TransportError::Closed.into();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn bridge_error_from_codec_error() {
        let err: BridgeError = CodecError::MissingTag("ENV").into();
        assert!(matches!(err, BridgeError::Codec(_)));
        assert_eq!(err.to_string(), "Codec error: Missing tag ENV");
    }

    #[test]
    fn bridge_error_from_inference_error() {
        let err: BridgeError = InferenceError::NoModel.into();
        assert!(matches!(err, BridgeError::Inference(_)));
    }

    #[test]
    fn config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let config_err: ConfigError = io_err.into();
        assert!(matches!(config_err, ConfigError::Io(_)));
    }

    #[test]
    fn transport_error_display_messages() {
        assert_eq!(
            TransportError::NotConnected("admin").to_string(),
            "No admin connection"
        );
        assert_eq!(
            TransportError::UnknownEnvironment(4).to_string(),
            "Environment 4 is out of range or not connected"
        );
        assert_eq!(
            TransportError::MissingEnvTag("OBS=1".into()).to_string(),
            "Message has no ENV tag: OBS=1"
        );
        assert_eq!(TransportError::PoolClosed.to_string(), "Socket pool is closed");
        assert_eq!(
            TransportError::PartialWrite {
                written: 3,
                total: 10
            }
            .to_string(),
            "Write timed out after 3 of 10 bytes; connection closed"
        );
    }

    #[test]
    fn codec_error_display_messages() {
        assert_eq!(
            CodecError::MalformedNumber {
                index: 2,
                segment: "abc".into()
            }
            .to_string(),
            "Malformed number \"abc\" at position 2"
        );
    }

    #[test]
    fn inference_error_wraps_codec_error() {
        let err: InferenceError = CodecError::MissingTag("OBS").into();
        assert!(matches!(err, InferenceError::Codec(_)));
        assert_eq!(
            InferenceError::ObservationDimMismatch {
                expected: 4,
                got: 3
            }
            .to_string(),
            "Observation dimension mismatch: model expects 4, got 3"
        );
    }
}
