//! Application framing inside a decrypted TLS stream.
//!
//! Each message is a JSON array of strings followed by a single NUL byte.
//! JSON escapes control characters, so the terminator never occurs inside an
//! encoded message. The first element is conventionally the routing target,
//! the rest a command and its arguments.

use crate::constants::MESSAGE_DELIMITER;
use crate::ProtocolError;

/// Encode message parts as a NUL-terminated JSON array.
pub fn encode_message<S: AsRef<str>>(parts: &[S]) -> Vec<u8> {
    let parts: Vec<&str> = parts.iter().map(AsRef::as_ref).collect();
    let mut out = serde_json::to_vec(&parts).unwrap_or_default();
    out.push(MESSAGE_DELIMITER);
    out
}

/// Decode one message (without its terminator) into its parts.
pub fn decode_message(bytes: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let bytes = bytes.strip_suffix(&[MESSAGE_DELIMITER]).unwrap_or(bytes);
    serde_json::from_slice::<Vec<String>>(bytes)
        .map_err(|e| ProtocolError::Malformed(format!("not a JSON string array: {e}")))
}

/// Reassembles NUL-delimited messages from plaintext that may arrive split
/// across TLS records.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed decrypted plaintext; returns every message completed by it.
    /// Empty segments (consecutive terminators) are skipped.
    pub fn push(&mut self, plaintext: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(plaintext);
        let mut messages = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == MESSAGE_DELIMITER) {
            let rest = self.pending.split_off(pos + 1);
            let mut message = std::mem::replace(&mut self.pending, rest);
            message.pop();
            if !message.is_empty() {
                messages.push(message);
            }
        }
        messages
    }

    /// Bytes buffered while waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
