//! Switchyard Protocol - wire constants and message definitions
//!
//! Shared by the master and the nodes: application framing inside a decrypted
//! TLS stream, control words and registration reply codes, the broadcast
//! signer/verifier and the certificate helpers used to derive peer claims.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod identity;
pub mod messages;
pub mod pki;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use constants::*;
pub use error::*;
pub use framing::{encode_message, decode_message, FrameAssembler};
pub use identity::PeerIdentity;
pub use messages::*;
pub use pki::PeerClaims;
pub use crypto::{BroadcastSigner, BroadcastVerifier};
