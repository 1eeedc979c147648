//! Multipart message framing.
//!
//! Each stream frame is 32-bit big-endian length-delimited (16 MiB max). The
//! frame body is a multipart message: a `u32` part count, then for every
//! part a `u32` length followed by its bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Maximum encoded size of one multipart message.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One message of the identity-routed transport.
pub type Multipart = Vec<Vec<u8>>;

pub struct MultipartCodec {
    inner: LengthDelimitedCodec,
}

impl MultipartCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

impl Decoder for MultipartCodec {
    type Item = Multipart;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Multipart>, std::io::Error> {
        let Some(mut frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if frame.remaining() < 4 {
            return Err(invalid("multipart frame too short"));
        }
        let count = frame.get_u32() as usize;
        // Every part needs at least its length prefix.
        if count > frame.remaining() / 4 {
            return Err(invalid("multipart part count exceeds frame"));
        }
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            if frame.remaining() < 4 {
                return Err(invalid("truncated part length"));
            }
            let len = frame.get_u32() as usize;
            if frame.remaining() < len {
                return Err(invalid("truncated part"));
            }
            parts.push(frame.split_to(len).to_vec());
        }
        if frame.has_remaining() {
            return Err(invalid("trailing bytes after last part"));
        }
        Ok(Some(parts))
    }
}

impl Encoder<Multipart> for MultipartCodec {
    type Error = std::io::Error;

    fn encode(&mut self, parts: Multipart, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        let size = 4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
        let mut body = BytesMut::with_capacity(size);
        body.put_u32(parts.len() as u32);
        for part in &parts {
            body.put_u32(part.len() as u32);
            body.put_slice(part);
        }
        self.inner.encode(Bytes::from(body), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_multipart() {
        let mut codec = MultipartCodec::new();
        let mut buf = BytesMut::new();
        let msg = vec![b"ident".to_vec(), Vec::new(), b"payload".to_vec()];
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = MultipartCodec::new();
        let mut full = BytesMut::new();
        codec.encode(vec![b"abc".to_vec()], &mut full).unwrap();
        let mut partial = full.split_to(full.len() - 1);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&full);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(vec![b"abc".to_vec()]));
    }

    #[test]
    fn test_bogus_part_count_rejected() {
        let mut codec = MultipartCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u32(1000);
        assert!(codec.decode(&mut buf).is_err());
    }
}
