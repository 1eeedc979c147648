use switchyard_protocol::ProtocolError;
use thiserror::Error;

/// Terminal failure of one TLS session. The session must be torn down; a
/// client may rebuild it and resend.
#[derive(Debug, Clone, Error)]
#[error("TLS session failed: {reason}")]
pub struct ConnectionError {
    pub reason: String,
}

impl ConnectionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<rustls::Error> for ConnectionError {
    fn from(e: rustls::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Errors raised by sockets, TLS contexts and the encrypted session layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("no route to peer {0}")]
    UnknownPeer(String),

    #[error("peer {0} is not reading; stream dropped")]
    Overloaded(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("socket closed")]
    Closed,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
