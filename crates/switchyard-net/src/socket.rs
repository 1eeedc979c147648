//! Identity-routed message sockets over stream transports.
//!
//! A [`RouterSocket`] accepts many streams and tags every inbound message
//! with the identity the peer announced when it connected; replies are
//! routed back by identity. A [`DealerSocket`] is the connecting side. A
//! [`PubSocket`] fans messages out to [`SubSocket`]s by exact topic and
//! reports every subscription change it receives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use switchyard_protocol::{PeerIdentity, SUBSCRIBE_ACTION, UNSUBSCRIBE_ACTION};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::{Multipart, MultipartCodec};
use crate::endpoint::{BoxedConn, Endpoint, Listener};
use crate::NetworkError;

type FramedConn = Framed<BoxedConn, MultipartCodec>;

const INBOUND_QUEUE: usize = 1024;
/// Outbound messages queued per peer stream. A peer that lets this fill up is
/// not reading and gets disconnected.
const PEER_QUEUE: usize = 256;

fn framed(conn: BoxedConn) -> FramedConn {
    Framed::new(conn, MultipartCodec::new())
}

// ── Router ──

struct Route {
    conn_id: u64,
    tx: mpsc::Sender<Multipart>,
    cancel: CancellationToken,
}

type Routes = Arc<RwLock<HashMap<PeerIdentity, Route>>>;

pub struct RouterSocket {
    endpoint: Endpoint,
    inbound: mpsc::Receiver<(PeerIdentity, Multipart)>,
    routes: Routes,
    cancel: CancellationToken,
}

impl RouterSocket {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, NetworkError> {
        let listener = endpoint.bind().await?;
        let local = listener.local_endpoint()?;
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        tokio::spawn(router_accept_loop(listener, tx, routes.clone(), cancel.clone()));
        tracing::debug!(endpoint = %local, "router socket bound");
        Ok(Self {
            endpoint: local,
            inbound: rx,
            routes,
            cancel,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Next message from any peer, tagged with its identity. `None` once the
    /// socket has shut down.
    pub async fn recv(&mut self) -> Option<(PeerIdentity, Multipart)> {
        self.inbound.recv().await
    }

    /// Route a message to the most recent stream that announced `ident`.
    /// Never waits on the peer: a stream whose queue is full is dropped.
    pub async fn send(&self, ident: &PeerIdentity, parts: Multipart) -> Result<(), NetworkError> {
        let overflowed = {
            let routes = self.routes.read().await;
            let route = routes
                .get(ident)
                .ok_or_else(|| NetworkError::UnknownPeer(ident.to_string()))?;
            match route.tx.try_send(parts) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => {
                    return Err(NetworkError::UnknownPeer(ident.to_string()))
                }
                Err(TrySendError::Full(_)) => route.conn_id,
            }
        };

        let mut routes = self.routes.write().await;
        if routes.get(ident).is_some_and(|r| r.conn_id == overflowed) {
            if let Some(route) = routes.remove(ident) {
                route.cancel.cancel();
            }
        }
        tracing::warn!(peer = %ident, "peer is not reading, stream dropped");
        Err(NetworkError::Overloaded(ident.to_string()))
    }

    pub async fn peer_count(&self) -> usize {
        self.routes.read().await.len()
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn router_accept_loop(
    listener: Listener,
    inbound: mpsc::Sender<(PeerIdentity, Multipart)>,
    routes: Routes,
    cancel: CancellationToken,
) {
    let mut next_conn_id = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    next_conn_id += 1;
                    tokio::spawn(router_conn(
                        next_conn_id,
                        framed(conn),
                        inbound.clone(),
                        routes.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => tracing::warn!(error = %e, "router accept failed"),
            }
        }
    }
}

fn announced_identity(first: Option<Multipart>) -> Result<PeerIdentity, NetworkError> {
    match first.as_deref().and_then(<[Vec<u8>]>::first) {
        Some(bytes) if !bytes.is_empty() => Ok(PeerIdentity::new(bytes.clone())?),
        _ => Ok(PeerIdentity::generate()),
    }
}

async fn router_conn(
    conn_id: u64,
    mut conn: FramedConn,
    inbound: mpsc::Sender<(PeerIdentity, Multipart)>,
    routes: Routes,
    cancel: CancellationToken,
) {
    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        first = conn.next() => first,
    };
    let ident = match first {
        Some(Ok(parts)) => match announced_identity(Some(parts)) {
            Ok(ident) => ident,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting stream with invalid identity");
                return;
            }
        },
        Some(Err(e)) => {
            tracing::debug!(error = %e, "stream failed before announcing identity");
            return;
        }
        None => return,
    };

    let (tx, mut rx) = mpsc::channel(PEER_QUEUE);
    let route = Route {
        conn_id,
        tx,
        cancel: cancel.clone(),
    };
    if routes
        .write()
        .await
        .insert(ident.clone(), route)
        .is_some()
    {
        tracing::debug!(peer = %ident, "identity announced on a second stream, routing replies there");
    }

    // Once another stream takes over this identity, replies stop coming here
    // but inbound messages keep flowing under the same identity.
    let mut routable = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = conn.next() => match incoming {
                Some(Ok(parts)) => {
                    if inbound.send((ident.clone(), parts)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(peer = %ident, error = %e, "dropping stream after framing error");
                    break;
                }
                None => break,
            },
            outgoing = rx.recv(), if routable => match outgoing {
                Some(parts) => {
                    if let Err(e) = conn.send(parts).await {
                        tracing::warn!(peer = %ident, error = %e, "write to peer failed");
                        break;
                    }
                }
                None => routable = false,
            },
        }
    }

    let mut routes = routes.write().await;
    if routes.get(&ident).is_some_and(|r| r.conn_id == conn_id) {
        routes.remove(&ident);
    }
}

// ── Dealer ──

/// Connecting side of a router. Announces its identity (or none, to have the
/// router assign one) as the first message on the stream.
pub struct DealerSocket {
    conn: FramedConn,
}

impl DealerSocket {
    pub async fn connect(
        endpoint: &Endpoint,
        identity: Option<&PeerIdentity>,
    ) -> Result<Self, NetworkError> {
        let mut conn = framed(endpoint.connect().await?);
        let announcement = identity.map(|i| i.as_bytes().to_vec()).unwrap_or_default();
        conn.send(vec![announcement]).await?;
        Ok(Self { conn })
    }

    pub async fn send(&mut self, parts: Multipart) -> Result<(), NetworkError> {
        self.conn.send(parts).await?;
        Ok(())
    }

    /// Cancel-safe: usable as a `select!` branch.
    pub async fn recv(&mut self) -> Result<Multipart, NetworkError> {
        match self.conn.next().await {
            Some(Ok(parts)) => Ok(parts),
            Some(Err(e)) => Err(e.into()),
            None => Err(NetworkError::Closed),
        }
    }
}

// ── Pub/Sub ──

struct Subscriber {
    tx: mpsc::Sender<Multipart>,
    topics: HashSet<Vec<u8>>,
    cancel: CancellationToken,
}

type Subscribers = Arc<RwLock<HashMap<u64, Subscriber>>>;

/// Publishing side. Subscription frames from subscribers (`action || topic`)
/// are applied and then surfaced through [`PubSocket::next_event`].
pub struct PubSocket {
    endpoint: Endpoint,
    subscribers: Subscribers,
    events: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl PubSocket {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, NetworkError> {
        let listener = endpoint.bind().await?;
        let local = listener.local_endpoint()?;
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        tokio::spawn(pub_accept_loop(listener, tx, subscribers.clone(), cancel.clone()));
        tracing::debug!(endpoint = %local, "pub socket bound");
        Ok(Self {
            endpoint: local,
            subscribers,
            events: rx,
            cancel,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send `[topic, payload]` to every subscriber of exactly `topic`.
    /// Returns how many subscribers it was queued for. Subscribers whose
    /// queue is full are disconnected.
    pub async fn publish(&self, topic: &[u8], payload: &[u8]) -> usize {
        let mut queued = 0;
        let mut stalled = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter().filter(|(_, s)| s.topics.contains(topic)) {
                match sub.tx.try_send(vec![topic.to_vec(), payload.to_vec()]) {
                    Ok(()) => queued += 1,
                    Err(TrySendError::Full(_)) => stalled.push(*id),
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
        if !stalled.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in stalled {
                if let Some(sub) = subscribers.remove(&id) {
                    tracing::warn!(subscriber = id, "subscriber is not reading, disconnected");
                    sub.cancel.cancel();
                }
            }
        }
        queued
    }

    /// Next subscription event: action byte followed by the topic.
    pub async fn next_event(&mut self) -> Option<Vec<u8>> {
        self.events.recv().await
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pub_accept_loop(
    listener: Listener,
    events: mpsc::Sender<Vec<u8>>,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    let mut next_id = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    next_id += 1;
                    tokio::spawn(pub_conn(
                        next_id,
                        framed(conn),
                        events.clone(),
                        subscribers.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => tracing::warn!(error = %e, "pub accept failed"),
            }
        }
    }
}

async fn pub_conn(
    id: u64,
    mut conn: FramedConn,
    events: mpsc::Sender<Vec<u8>>,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel(PEER_QUEUE);
    subscribers.write().await.insert(
        id,
        Subscriber {
            tx,
            topics: HashSet::new(),
            cancel: cancel.clone(),
        },
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = conn.next() => match incoming {
                Some(Ok(parts)) => {
                    let Some(event) = parts.into_iter().next().filter(|e| !e.is_empty()) else {
                        continue;
                    };
                    let topic = event[1..].to_vec();
                    {
                        let mut subs = subscribers.write().await;
                        let Some(sub) = subs.get_mut(&id) else { break };
                        match event[0] {
                            SUBSCRIBE_ACTION => {
                                sub.topics.insert(topic);
                            }
                            UNSUBSCRIBE_ACTION => {
                                sub.topics.remove(&topic);
                            }
                            other => {
                                tracing::debug!(action = other, "ignoring unknown subscription action");
                                continue;
                            }
                        }
                    }
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "dropping subscriber after framing error");
                    break;
                }
                None => break,
            },
            outgoing = rx.recv() => match outgoing {
                Some(parts) => {
                    if let Err(e) = conn.send(parts).await {
                        tracing::debug!(error = %e, "write to subscriber failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    subscribers.write().await.remove(&id);
}

/// Subscribing side. Receives `[topic, payload]` for subscribed topics only.
pub struct SubSocket {
    conn: FramedConn,
}

impl SubSocket {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, NetworkError> {
        Ok(Self {
            conn: framed(endpoint.connect().await?),
        })
    }

    async fn control(&mut self, action: u8, topic: &[u8]) -> Result<(), NetworkError> {
        let mut frame = Vec::with_capacity(topic.len() + 1);
        frame.push(action);
        frame.extend_from_slice(topic);
        self.conn.send(vec![frame]).await?;
        Ok(())
    }

    pub async fn subscribe(&mut self, topic: &[u8]) -> Result<(), NetworkError> {
        self.control(SUBSCRIBE_ACTION, topic).await
    }

    pub async fn unsubscribe(&mut self, topic: &[u8]) -> Result<(), NetworkError> {
        self.control(UNSUBSCRIBE_ACTION, topic).await
    }

    /// Cancel-safe: usable as a `select!` branch.
    pub async fn recv(&mut self) -> Result<Multipart, NetworkError> {
        match self.conn.next().await {
            Some(Ok(parts)) => Ok(parts),
            Some(Err(e)) => Err(e.into()),
            None => Err(NetworkError::Closed),
        }
    }
}
