use thiserror::Error;

/// Errors raised while encoding, decoding or authenticating protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
