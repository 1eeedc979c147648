use std::path::PathBuf;
use std::time::Duration;

use switchyard_net::NetworkError;
use switchyard_protocol::{ProtocolError, RejectionCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("no platform config directory; pass --config")]
    NoConfigDir,

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Terminal answer from the master. The reason is the master's text
    /// when it sent one.
    #[error("registration rejected ({code}): {reason}")]
    Rejected { code: RejectionCode, reason: String },

    #[error("no approval within {0:?}")]
    Timeout(Duration),

    #[error("issued certificates failed verification: {0}")]
    Verification(String),

    #[error("cannot write {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("certificate controller failed: {0}")]
    Controller(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
