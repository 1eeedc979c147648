use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use sha2::{Digest, Sha256};

use crate::pki;
use crate::ProtocolError;

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(data);
    let mut result = [0u8; 32];
    result.copy_from_slice(&hash);
    result
}

/// Content-derived identifier: hex SHA-256 of the data.
pub fn compute_cid(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Signs broadcast frames with the broker's private key.
///
/// Pub/sub fan-out has no per-subscriber session, so each published payload
/// carries its own signature: `signature (64 bytes) || json(frames)`. This
/// authenticates the broker; it does not hide the frames.
pub struct BroadcastSigner {
    key: SigningKey,
}

impl BroadcastSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Load from a PKCS#8 PEM private key, decrypting it with `passphrase`
    /// when the PEM is an encrypted private key.
    pub fn from_pkcs8_pem(pem: &str, passphrase: Option<&str>) -> Result<Self, ProtocolError> {
        let der = pki::decode_private_key(pem, passphrase)?;
        let key = SigningKey::from_pkcs8_der(&der)
            .map_err(|e| ProtocolError::Crypto(format!("broadcast key is not Ed25519 PKCS#8: {e}")))?;
        Ok(Self::new(key))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Serialize `frames` and sign them.
    pub fn encrypt<S: AsRef<str>>(&self, frames: &[S]) -> Result<Vec<u8>, ProtocolError> {
        let frames: Vec<&str> = frames.iter().map(AsRef::as_ref).collect();
        let body = serde_json::to_vec(&frames)?;
        let signature = self.key.sign(&body);
        let mut out = Vec::with_capacity(SIGNATURE_LENGTH + body.len());
        out.extend_from_slice(&signature.to_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Verifies payloads produced by [`BroadcastSigner`].
#[derive(Clone)]
pub struct BroadcastVerifier {
    key: VerifyingKey,
}

impl BroadcastVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Take the public key from the broker's certificate.
    pub fn from_certificate_pem(pem: &str) -> Result<Self, ProtocolError> {
        let der = pki::parse_pem(pem)?;
        let raw = pki::certificate_public_key(&der)?;
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            ProtocolError::Certificate(format!(
                "certificate key is {} bytes, expected an Ed25519 key",
                raw.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ProtocolError::Certificate(format!("invalid Ed25519 public key: {e}")))?;
        Ok(Self::new(key))
    }

    /// Verify and parse a signed payload back into its frames. Fails on a
    /// short payload, a bad signature or an unparsable body.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<String>, ProtocolError> {
        if payload.len() < SIGNATURE_LENGTH {
            return Err(ProtocolError::InvalidSignature(format!(
                "payload of {} bytes is shorter than a signature",
                payload.len()
            )));
        }
        let (sig, body) = payload.split_at(SIGNATURE_LENGTH);
        let signature = Signature::from_slice(sig)
            .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
        self.key
            .verify(body, &signature)
            .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
        serde_json::from_slice::<Vec<String>>(body)
            .map_err(|e| ProtocolError::Malformed(format!("broadcast body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut rand::thread_rng())
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = BroadcastSigner::new(keypair());
        let verifier = BroadcastVerifier::new(signer.verifying_key());
        let payload = signer.encrypt(&["HEARTBEAT", "tenant-1"]).unwrap();
        assert_eq!(verifier.decrypt(&payload).unwrap(), vec!["HEARTBEAT", "tenant-1"]);
    }

    #[test]
    fn test_mismatched_key_fails() {
        let signer = BroadcastSigner::new(keypair());
        let other = BroadcastVerifier::new(keypair().verifying_key());
        let payload = signer.encrypt(&["WELCOME"]).unwrap();
        assert!(matches!(other.decrypt(&payload), Err(ProtocolError::InvalidSignature(_))));
    }

    #[test]
    fn test_tampered_body_fails() {
        let signer = BroadcastSigner::new(keypair());
        let verifier = BroadcastVerifier::new(signer.verifying_key());
        let mut payload = signer.encrypt(&["a", "b"]).unwrap();
        let last = payload.len() - 2;
        payload[last] ^= 0x01;
        assert!(verifier.decrypt(&payload).is_err());
    }

    #[test]
    fn test_short_payload_fails() {
        let verifier = BroadcastVerifier::new(keypair().verifying_key());
        assert!(verifier.decrypt(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_compute_cid_is_hex_sha256() {
        let cid = compute_cid(b"Alpha");
        assert_eq!(cid.len(), 64);
        assert_eq!(cid, compute_cid(b"Alpha"));
        assert_ne!(cid, compute_cid(b"Beta"));
    }
}
