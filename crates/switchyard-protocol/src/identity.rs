use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{GENERATED_IDENTITY_LEN, MAX_IDENTITY_LEN};
use crate::ProtocolError;

/// Opaque routing token naming one peer on a multiplexed socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(Vec<u8>);

impl PeerIdentity {
    /// Wrap raw identity bytes. Identities must be 1..=32 bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_IDENTITY_LEN {
            return Err(ProtocolError::Malformed(format!(
                "identity must be 1..={MAX_IDENTITY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Random identity for peers that do not announce one.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; GENERATED_IDENTITY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl AsRef<[u8]> for PeerIdentity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_length_bounds() {
        assert!(PeerIdentity::new(Vec::new()).is_err());
        assert!(PeerIdentity::new(vec![1u8; 32]).is_ok());
        assert!(PeerIdentity::new(vec![1u8; 33]).is_err());
    }

    #[test]
    fn test_generated_identity() {
        let a = PeerIdentity::generate();
        assert_eq!(a.as_bytes().len(), GENERATED_IDENTITY_LEN);
        assert_eq!(a.to_string().len(), GENERATED_IDENTITY_LEN * 2);
    }
}
