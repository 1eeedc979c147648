//! TLS record engine.
//!
//! Drives one rustls session entirely through in-memory buffers, so the
//! ciphertext can travel over any message transport:
//!
//! ```text
//!   send() ─► app_out ─► session ─► net_out ─► take_ciphertext()
//!   recv() ◄─ app_in  ◄─ session ◄─ net_in  ◄─ put_ciphertext()
//! ```
//!
//! Plaintext only crosses the boundary through `send`/`recv`.

use std::io::{ErrorKind, Read, Write};

use rustls::pki_types::CertificateDer;
use rustls::{ClientConnection, Connection, ServerConnection};

use crate::tls::{ClientTlsContext, ServerTlsContext};
use crate::{ConnectionError, NetworkError};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Accept,
    Connect,
}

pub struct RecordEngine {
    session: Connection,
    role: Role,
    net_in: Vec<u8>,
    net_out: Vec<u8>,
    app_in: Vec<u8>,
    app_out: Vec<u8>,
    peer_closed: bool,
}

impl RecordEngine {
    fn with_session(session: Connection, role: Role) -> Self {
        Self {
            session,
            role,
            net_in: Vec::new(),
            net_out: Vec::new(),
            app_in: Vec::new(),
            app_out: Vec::new(),
            peer_closed: false,
        }
    }

    /// Server-role session.
    pub fn accept(ctx: &ServerTlsContext) -> Result<Self, NetworkError> {
        let session = ServerConnection::new(ctx.config())
            .map_err(|e| NetworkError::TlsConfig(format!("server session: {e}")))?;
        Ok(Self::with_session(session.into(), Role::Accept))
    }

    /// Client-role session. The ClientHello is queued immediately, so
    /// `take_ciphertext` has data right after construction.
    pub fn connect(ctx: &ClientTlsContext) -> Result<Self, NetworkError> {
        let session = ClientConnection::new(ctx.config(), ctx.server_name())
            .map_err(|e| NetworkError::TlsConfig(format!("client session: {e}")))?;
        let mut engine = Self::with_session(session.into(), Role::Connect);
        engine.write_records().map_err(NetworkError::Connection)?;
        Ok(engine)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue ciphertext received from the wire. Unbounded; callers bound it.
    pub fn put_ciphertext(&mut self, bytes: &[u8]) {
        self.net_in.extend_from_slice(bytes);
    }

    /// Queue plaintext for encryption.
    pub fn send(&mut self, bytes: &[u8]) {
        self.app_out.extend_from_slice(bytes);
    }

    /// Drain decrypted plaintext.
    pub fn recv(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.app_in)
    }

    /// Drain ciphertext destined for the wire.
    pub fn take_ciphertext(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.net_out)
    }

    pub fn can_recv(&self) -> bool {
        !self.app_in.is_empty()
    }

    pub fn needs_write(&self) -> bool {
        !self.net_out.is_empty()
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// True once the peer has sent close-notify.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Leaf certificate the peer presented, if any.
    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.session.peer_certificates().and_then(|certs| certs.first())
    }

    /// Pump every buffer once: feed received ciphertext to the session,
    /// collect decrypted plaintext, hand queued plaintext to the session
    /// once the handshake is done, and collect outgoing records.
    ///
    /// Returns whether all queued plaintext has been handed to the session.
    /// On a terminal session error any pending alert is still moved to the
    /// outgoing buffer before the error is returned.
    pub fn update(&mut self) -> Result<bool, ConnectionError> {
        match self.pump() {
            Ok(flushed) => Ok(flushed),
            Err(e) => {
                let _ = self.write_records();
                Err(e)
            }
        }
    }

    fn pump(&mut self) -> Result<bool, ConnectionError> {
        while !self.net_in.is_empty() {
            let mut pending = self.net_in.as_slice();
            let consumed = self.session.read_tls(&mut pending)?;
            self.net_in.drain(..consumed);
            self.session.process_new_packets()?;
            self.read_plaintext()?;
            if consumed == 0 {
                break;
            }
        }
        self.read_plaintext()?;

        // The session buffers a bounded amount of outgoing TLS, so alternate
        // writes and record collection until the plaintext is gone.
        while !self.session.is_handshaking() && !self.app_out.is_empty() {
            let written = self.session.writer().write(&self.app_out)?;
            self.app_out.drain(..written);
            self.write_records()?;
            if written == 0 {
                break;
            }
        }

        self.write_records()?;
        Ok(self.app_out.is_empty())
    }

    fn read_plaintext(&mut self) -> Result<(), ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.session.reader().read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Ok(n) => self.app_in.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_records(&mut self) -> Result<(), ConnectionError> {
        while self.session.wants_write() {
            self.session.write_tls(&mut self.net_out)?;
        }
        Ok(())
    }

    /// Best-effort close-notify. The caller forwards `take_ciphertext` and
    /// then drops the engine.
    pub fn shutdown(&mut self) {
        self.session.send_close_notify();
        if let Err(e) = self.write_records() {
            tracing::debug!(error = %e, "close-notify not flushed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsMaterial;
    use switchyard_protocol::testing::TestAuthority;

    fn contexts() -> (ServerTlsContext, ClientTlsContext) {
        let ca = TestAuthority::new("Test CA");
        let (server_cert, server_key) = ca.issue_server("master");
        let (client_cert, client_key) = ca.issue_client("n1", "Alpha");
        let server = ServerTlsContext::new(&TlsMaterial {
            cert_pem: Some(server_cert),
            key_pem: Some(server_key),
            ca_pems: vec![ca.cert_pem().to_string()],
            ..TlsMaterial::default()
        })
        .unwrap();
        let client = ClientTlsContext::new(&TlsMaterial {
            cert_pem: Some(client_cert),
            key_pem: Some(client_key),
            ca_pems: vec![ca.cert_pem().to_string()],
            ..TlsMaterial::default()
        })
        .unwrap();
        (server, client)
    }

    /// Shuttle ciphertext both ways in `chunk`-sized pieces until neither
    /// side has anything left to write.
    fn drive(a: &mut RecordEngine, b: &mut RecordEngine, chunk: usize) {
        for _ in 0..10_000 {
            a.update().unwrap();
            b.update().unwrap();
            if !a.needs_write() && !b.needs_write() {
                a.update().unwrap();
                b.update().unwrap();
                if !a.needs_write() && !b.needs_write() {
                    return;
                }
            }
            for piece in a.take_ciphertext().chunks(chunk) {
                b.put_ciphertext(piece);
                b.update().unwrap();
            }
            for piece in b.take_ciphertext().chunks(chunk) {
                a.put_ciphertext(piece);
                a.update().unwrap();
            }
        }
        panic!("engines never reached quiescence");
    }

    #[test]
    fn test_handshake_completes() {
        let (server_ctx, client_ctx) = contexts();
        let mut server = RecordEngine::accept(&server_ctx).unwrap();
        let mut client = RecordEngine::connect(&client_ctx).unwrap();
        assert!(client.needs_write());
        drive(&mut client, &mut server, 4096);
        assert!(!client.is_handshaking());
        assert!(!server.is_handshaking());
        assert!(server.peer_certificate().is_some());
        assert_eq!(server.role(), Role::Accept);
    }

    #[test]
    fn test_no_loss_across_chunk_sizes() {
        let (server_ctx, client_ctx) = contexts();
        for chunk in [1, 7, 512, 100_000] {
            let mut server = RecordEngine::accept(&server_ctx).unwrap();
            let mut client = RecordEngine::connect(&client_ctx).unwrap();
            let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
            client.send(&payload);
            drive(&mut client, &mut server, chunk);
            assert!(client.update().unwrap(), "send should be fully flushed");
            assert_eq!(server.recv(), payload, "chunk size {chunk}");
            assert!(!server.can_recv());
        }
    }

    #[test]
    fn test_one_update_flushes_large_send() {
        let (server_ctx, client_ctx) = contexts();
        let mut server = RecordEngine::accept(&server_ctx).unwrap();
        let mut client = RecordEngine::connect(&client_ctx).unwrap();
        drive(&mut client, &mut server, 4096);

        let payload = vec![b'x'; 300_000];
        server.send(&payload);
        assert!(server.update().unwrap(), "plaintext left behind after one update");
        client.put_ciphertext(&server.take_ciphertext());
        client.update().unwrap();
        assert_eq!(client.recv(), payload);
    }

    #[test]
    fn test_both_directions() {
        let (server_ctx, client_ctx) = contexts();
        let mut server = RecordEngine::accept(&server_ctx).unwrap();
        let mut client = RecordEngine::connect(&client_ctx).unwrap();
        client.send(b"ping");
        drive(&mut client, &mut server, 300);
        assert_eq!(server.recv(), b"ping");
        server.send(b"pong");
        drive(&mut server, &mut client, 300);
        assert_eq!(client.recv(), b"pong");
    }

    #[test]
    fn test_send_before_handshake_is_held() {
        let (_, client_ctx) = contexts();
        let mut client = RecordEngine::connect(&client_ctx).unwrap();
        client.send(b"early");
        assert!(!client.update().unwrap());
    }

    #[test]
    fn test_garbage_is_connection_error() {
        let (server_ctx, _) = contexts();
        let mut server = RecordEngine::accept(&server_ctx).unwrap();
        server.put_ciphertext(b"this is not a TLS record at all");
        assert!(server.update().is_err());
    }

    #[test]
    fn test_shutdown_reaches_peer() {
        let (server_ctx, client_ctx) = contexts();
        let mut server = RecordEngine::accept(&server_ctx).unwrap();
        let mut client = RecordEngine::connect(&client_ctx).unwrap();
        drive(&mut client, &mut server, 4096);
        client.shutdown();
        server.put_ciphertext(&client.take_ciphertext());
        server.update().unwrap();
        assert!(server.peer_closed());
    }
}
