//! Encrypted socket adapter.
//!
//! Binds one server-role [`RecordEngine`] per peer identity to a
//! [`RouterSocket`]. Inbound frames carry ciphertext (or the teardown
//! sentinel); decrypted plaintext is split into application messages and
//! handed to the router task as [`AdapterEvent`]s. Replies come back on a
//! channel and are encrypted to the originating peer.
//!
//! The connection cache is owned by the adapter task alone. A given identity
//! maps to at most one live connection.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use switchyard_protocol::{
    encode_message, pki, FrameAssembler, PeerClaims, PeerIdentity, DEFAULT_ANONYMOUS_IDLE_SECS,
    POLL_INTERVAL_MS, TEARDOWN_SENTINEL,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::record::RecordEngine;
use crate::socket::RouterSocket;
use crate::tls::ServerTlsContext;
use crate::NetworkError;

const EVENT_QUEUE: usize = 1024;
/// A peer packing more messages than this into one frame is disconnected.
const MAX_MESSAGES_PER_FRAME: usize = EVENT_QUEUE / 4;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub endpoint: Endpoint,
    /// Unauthenticated connections idle longer than this are evicted.
    pub anonymous_idle_timeout: Duration,
    pub poll_interval: Duration,
}

impl AdapterConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            anonymous_idle_timeout: Duration::from_secs(DEFAULT_ANONYMOUS_IDLE_SECS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
        }
    }
}

/// What the adapter reports to the router.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// One complete application message (without its terminator).
    Message {
        ident: PeerIdentity,
        claims: Option<PeerClaims>,
        message: Vec<u8>,
    },
    /// The peer tore its connection down.
    Departed {
        ident: PeerIdentity,
        claims: Option<PeerClaims>,
    },
}

impl AdapterEvent {
    pub fn ident(&self) -> &PeerIdentity {
        match self {
            Self::Message { ident, .. } | Self::Departed { ident, .. } => ident,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Handshake not finished yet.
    Pending,
    Authenticated(PeerClaims),
    /// No usable client certificate. Permanent for the connection.
    Anonymous,
}

impl AuthState {
    pub fn claims(&self) -> Option<&PeerClaims> {
        match self {
            Self::Authenticated(claims) => Some(claims),
            _ => None,
        }
    }
}

pub struct Connection {
    engine: RecordEngine,
    auth: AuthState,
    frames: FrameAssembler,
    replied: bool,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Connection {
    pub fn new(engine: RecordEngine, now: DateTime<Utc>) -> Self {
        Self {
            engine,
            auth: AuthState::Pending,
            frames: FrameAssembler::new(),
            replied: false,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Set claims once the handshake is done. No-op afterwards.
    fn settle_auth(&mut self, ident: &PeerIdentity) {
        if self.auth != AuthState::Pending || self.engine.is_handshaking() {
            return;
        }
        self.auth = match self.engine.peer_certificate().map(|c| pki::extract_claims(c)) {
            Some(Ok(claims)) => {
                tracing::info!(peer = %ident, client = %claims.client_id, org = %claims.org_id, "peer authenticated");
                AuthState::Authenticated(claims)
            }
            Some(Err(e)) => {
                tracing::warn!(peer = %ident, error = %e, "peer certificate has no usable claims");
                AuthState::Anonymous
            }
            None => {
                tracing::debug!(peer = %ident, "peer presented no certificate");
                AuthState::Anonymous
            }
        };
    }
}

/// Connections keyed by peer identity.
#[derive(Default)]
pub struct ConnectionCache {
    conns: HashMap<PeerIdentity, Connection>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ident: PeerIdentity, conn: Connection) -> Option<Connection> {
        self.conns.insert(ident, conn)
    }

    pub fn get_mut(&mut self, ident: &PeerIdentity) -> Option<&mut Connection> {
        self.conns.get_mut(ident)
    }

    pub fn contains(&self, ident: &PeerIdentity) -> bool {
        self.conns.contains_key(ident)
    }

    pub fn evict(&mut self, ident: &PeerIdentity) -> Option<Connection> {
        self.conns.remove(ident)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Identities of unauthenticated connections idle longer than `timeout`.
    pub fn idle_unauthenticated(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<PeerIdentity> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(3650));
        self.conns
            .iter()
            .filter(|(_, c)| c.auth.claims().is_none() && now - c.last_activity > timeout)
            .map(|(ident, _)| ident.clone())
            .collect()
    }

    fn drain(&mut self) -> impl Iterator<Item = (PeerIdentity, Connection)> + '_ {
        self.conns.drain()
    }
}

/// Cloneable handle used to send replies through a running adapter.
#[derive(Clone)]
pub struct AdapterHandle {
    endpoint: Endpoint,
    outbound: mpsc::Sender<(PeerIdentity, Vec<String>)>,
    live: watch::Receiver<usize>,
}

impl AdapterHandle {
    /// Address the adapter is actually listening on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Queue `parts` to be encrypted to `ident`.
    pub async fn reply(&self, ident: PeerIdentity, parts: Vec<String>) -> Result<(), NetworkError> {
        self.outbound
            .send((ident, parts))
            .await
            .map_err(|_| NetworkError::Closed)
    }

    /// Number of live connections, updated as the adapter works.
    pub fn live_connections(&self) -> watch::Receiver<usize> {
        self.live.clone()
    }
}

pub struct EncryptedAdapter {
    router: RouterSocket,
    tls: ServerTlsContext,
    cache: ConnectionCache,
    events: mpsc::Sender<AdapterEvent>,
    outbound: mpsc::Receiver<(PeerIdentity, Vec<String>)>,
    live: watch::Sender<usize>,
    config: AdapterConfig,
}

impl EncryptedAdapter {
    /// Bind the public router socket. The returned receiver yields every
    /// decrypted message and departure.
    pub async fn bind(
        config: AdapterConfig,
        tls: ServerTlsContext,
    ) -> Result<(Self, AdapterHandle, mpsc::Receiver<AdapterEvent>), NetworkError> {
        let router = RouterSocket::bind(&config.endpoint).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(EVENT_QUEUE);
        let (live_tx, live_rx) = watch::channel(0);
        let handle = AdapterHandle {
            endpoint: router.endpoint().clone(),
            outbound: outbound_tx,
            live: live_rx,
        };
        tracing::info!(endpoint = %router.endpoint(), "encrypted adapter listening");
        let adapter = Self {
            router,
            tls,
            cache: ConnectionCache::new(),
            events: events_tx,
            outbound: outbound_rx,
            live: live_tx,
            config,
        };
        Ok((adapter, handle, events_rx))
    }

    /// Run until cancelled or the router socket closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        let mut outbound_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close_all().await;
                    break;
                }
                inbound = self.router.recv() => match inbound {
                    Some((ident, parts)) => self.handle_frame(ident, parts).await,
                    None => {
                        tracing::warn!("router socket closed, adapter stopping");
                        break;
                    }
                },
                reply = self.outbound.recv(), if outbound_open => match reply {
                    Some((ident, parts)) => self.handle_reply(ident, parts).await,
                    None => outbound_open = false,
                },
                _ = tick.tick() => self.evict_idle(),
            }
            self.live.send_replace(self.cache.len());
        }
        tracing::info!("encrypted adapter stopped");
    }

    /// Never waits: the consumer may itself be waiting on this task to
    /// deliver its replies.
    fn emit(&self, event: AdapterEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(peer = %event.ident(), "event queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => tracing::debug!("adapter event dropped, no receiver"),
        }
    }

    async fn handle_frame(&mut self, ident: PeerIdentity, parts: Vec<Vec<u8>>) {
        let [ciphertext] = parts.as_slice() else {
            tracing::warn!(peer = %ident, parts = parts.len(), "expected a single ciphertext part");
            return;
        };

        if ciphertext.as_slice() == TEARDOWN_SENTINEL {
            if let Some(conn) = self.cache.evict(&ident) {
                tracing::info!(peer = %ident, "peer tore down its connection");
                let claims = conn.auth.claims().cloned();
                self.emit(AdapterEvent::Departed { ident, claims });
            }
            return;
        }

        let now = Utc::now();
        let fresh = !self.cache.contains(&ident);
        if fresh {
            match RecordEngine::accept(&self.tls) {
                Ok(engine) => {
                    tracing::debug!(peer = %ident, "new connection");
                    self.cache.insert(ident.clone(), Connection::new(engine, now));
                }
                Err(e) => {
                    tracing::error!(peer = %ident, error = %e, "cannot create session");
                    return;
                }
            }
        }
        let Some(conn) = self.cache.get_mut(&ident) else {
            return;
        };

        conn.last_activity = now;
        conn.engine.put_ciphertext(ciphertext);
        if let Err(e) = conn.engine.update() {
            tracing::warn!(peer = %ident, error = %e, "session failed, dropping connection");
            let alert = conn.engine.take_ciphertext();
            self.cache.evict(&ident);
            // Only established connections get the alert.
            if !fresh {
                self.send_ciphertext(&ident, alert).await;
            }
            return;
        }
        conn.settle_auth(&ident);

        let mut messages = Vec::new();
        if conn.engine.can_recv() {
            let plaintext = conn.engine.recv();
            messages = conn.frames.push(&plaintext);
        }
        let claims = conn.auth.claims().cloned();
        let closed = conn.engine.peer_closed();
        let ciphertext = conn.engine.take_ciphertext();

        if messages.len() > MAX_MESSAGES_PER_FRAME {
            tracing::warn!(peer = %ident, messages = messages.len(), "too many messages in one frame, dropping connection");
            self.cache.evict(&ident);
            self.emit(AdapterEvent::Departed { ident, claims });
            return;
        }

        self.send_ciphertext(&ident, ciphertext).await;
        for message in messages {
            self.emit(AdapterEvent::Message {
                ident: ident.clone(),
                claims: claims.clone(),
                message,
            });
        }
        if closed {
            tracing::info!(peer = %ident, "peer sent close-notify");
            self.cache.evict(&ident);
            self.emit(AdapterEvent::Departed { ident, claims });
        }
    }

    async fn handle_reply(&mut self, ident: PeerIdentity, parts: Vec<String>) {
        let Some(conn) = self.cache.get_mut(&ident) else {
            tracing::warn!(peer = %ident, "reply for unknown connection dropped");
            return;
        };
        conn.engine.send(&encode_message(&parts));
        let flushed = match conn.engine.update() {
            Ok(flushed) => flushed,
            Err(e) => {
                tracing::warn!(peer = %ident, error = %e, "session failed while replying");
                self.cache.evict(&ident);
                return;
            }
        };
        conn.replied = true;
        conn.last_activity = Utc::now();
        let anonymous_done = flushed && conn.auth == AuthState::Anonymous;
        let ciphertext = conn.engine.take_ciphertext();
        self.send_ciphertext(&ident, ciphertext).await;

        if anonymous_done {
            tracing::debug!(peer = %ident, "anonymous peer answered, dropping connection");
            self.cache.evict(&ident);
        }
    }

    async fn send_ciphertext(&self, ident: &PeerIdentity, ciphertext: Vec<u8>) {
        if ciphertext.is_empty() {
            return;
        }
        if let Err(e) = self.router.send(ident, vec![ciphertext]).await {
            tracing::warn!(peer = %ident, error = %e, "ciphertext not delivered");
        }
    }

    fn evict_idle(&mut self) {
        let idle = self
            .cache
            .idle_unauthenticated(Utc::now(), self.config.anonymous_idle_timeout);
        for ident in idle {
            tracing::debug!(peer = %ident, "evicting idle unauthenticated connection");
            self.cache.evict(&ident);
        }
    }

    async fn close_all(&mut self) {
        let closing: Vec<(PeerIdentity, Vec<u8>)> = self
            .cache
            .drain()
            .map(|(ident, mut conn)| {
                conn.engine.shutdown();
                (ident, conn.engine.take_ciphertext())
            })
            .collect();
        for (ident, ciphertext) in closing {
            self.send_ciphertext(&ident, ciphertext).await;
        }
    }
}
