//! Client role of the encrypted session layer.
//!
//! A [`DealerSocket`] carrying one client-role [`RecordEngine`]. When the
//! session fails the client rebuilds it under the same routing identity and
//! resends the request that was in flight.

use std::collections::VecDeque;
use std::time::Duration;

use switchyard_protocol::{decode_message, encode_message, FrameAssembler, PeerIdentity, TEARDOWN_SENTINEL};

use crate::endpoint::Endpoint;
use crate::record::RecordEngine;
use crate::socket::DealerSocket;
use crate::tls::ClientTlsContext;
use crate::NetworkError;

const DEFAULT_MAX_ATTEMPTS: usize = 3;

pub struct EncryptedClient {
    endpoint: Endpoint,
    identity: PeerIdentity,
    tls: ClientTlsContext,
    dealer: DealerSocket,
    engine: RecordEngine,
    frames: FrameAssembler,
    inbox: VecDeque<Vec<String>>,
    max_attempts: usize,
}

impl EncryptedClient {
    /// Connect and start the handshake. Without an identity a random one is
    /// chosen and kept across reconnects.
    pub async fn connect(
        endpoint: &Endpoint,
        identity: Option<PeerIdentity>,
        tls: ClientTlsContext,
    ) -> Result<Self, NetworkError> {
        let identity = identity.unwrap_or_else(PeerIdentity::generate);
        let dealer = DealerSocket::connect(endpoint, Some(&identity)).await?;
        let engine = RecordEngine::connect(&tls)?;
        let mut client = Self {
            endpoint: endpoint.clone(),
            identity,
            tls,
            dealer,
            engine,
            frames: FrameAssembler::new(),
            inbox: VecDeque::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        client.flush().await?;
        tracing::debug!(endpoint = %client.endpoint, peer = %client.identity, "encrypted client connected");
        Ok(client)
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Drop the current session and start a fresh handshake. The peer is
    /// told to forget the old session first.
    pub async fn reconnect(&mut self) -> Result<(), NetworkError> {
        self.dealer.send(vec![TEARDOWN_SENTINEL.to_vec()]).await?;
        self.engine = RecordEngine::connect(&self.tls)?;
        self.frames = FrameAssembler::new();
        self.inbox.clear();
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), NetworkError> {
        if self.engine.needs_write() {
            let ciphertext = self.engine.take_ciphertext();
            self.dealer.send(vec![ciphertext]).await?;
        }
        Ok(())
    }

    /// Encrypt and send one application message. Before the handshake
    /// finishes the message is held and goes out with a later `recv`.
    pub async fn send<S: AsRef<str>>(&mut self, parts: &[S]) -> Result<(), NetworkError> {
        self.engine.send(&encode_message(parts));
        self.engine.update()?;
        self.flush().await
    }

    /// Next complete application message from the peer.
    pub async fn recv(&mut self) -> Result<Vec<String>, NetworkError> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(message);
            }
            let parts = self.dealer.recv().await?;
            for part in &parts {
                self.engine.put_ciphertext(part);
            }
            // Alerts from a failed session are dropped; reconnect tears it down.
            self.engine.update()?;
            self.flush().await?;

            if self.engine.can_recv() {
                let plaintext = self.engine.recv();
                for message in self.frames.push(&plaintext) {
                    self.inbox.push_back(decode_message(&message)?);
                }
            }
            if self.engine.peer_closed() && self.inbox.is_empty() {
                return Err(NetworkError::Closed);
            }
        }
    }

    /// Request/response exchange. A failed session is rebuilt and the
    /// request resent, up to the configured number of attempts.
    pub async fn call<S: AsRef<str>>(
        &mut self,
        parts: &[S],
        timeout: Duration,
    ) -> Result<Vec<String>, NetworkError> {
        let mut attempt = 1;
        loop {
            let exchange = async {
                self.send(parts).await?;
                self.recv().await
            };
            let outcome = tokio::time::timeout(timeout, exchange).await;
            match outcome {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(NetworkError::Connection(e))) if attempt < self.max_attempts => {
                    tracing::warn!(error = %e, attempt, "session failed, rebuilding and resending");
                    self.reconnect().await?;
                    attempt += 1;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(NetworkError::Timeout(timeout)),
            }
        }
    }

    /// Close-notify followed by the teardown sentinel.
    pub async fn close(mut self) -> Result<(), NetworkError> {
        self.engine.shutdown();
        self.flush().await?;
        self.dealer.send(vec![TEARDOWN_SENTINEL.to_vec()]).await
    }
}
