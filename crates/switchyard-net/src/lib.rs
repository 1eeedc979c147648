//! Switchyard Network - identity-routed sockets and the encrypted session layer
//!
//! Provides:
//! - Length-delimited multipart framing over TCP and Unix-domain streams
//! - Router/dealer and pub/sub sockets whose frames are tagged with a peer identity
//! - Server and client TLS contexts built once at startup
//! - The TLS record engine: a rustls session driven through in-memory buffers
//! - The encrypted socket adapter (one record engine per peer identity)
//! - A self-healing encrypted client for nodes

pub mod adapter;
pub mod client;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod record;
pub mod socket;
pub mod tls;

pub use adapter::{AdapterConfig, AdapterEvent, AdapterHandle, EncryptedAdapter};
pub use client::EncryptedClient;
pub use codec::{Multipart, MultipartCodec};
pub use endpoint::Endpoint;
pub use error::{ConnectionError, NetworkError};
pub use record::{RecordEngine, Role};
pub use socket::{DealerSocket, PubSocket, RouterSocket, SubSocket};
pub use tls::{ClientTlsContext, ServerTlsContext, TlsMaterial, TlsSettings};
