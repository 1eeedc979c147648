//! Node runtime after registration: heartbeats over the encrypted session and
//! verified broadcasts from the publish socket.

use std::time::Duration;

use switchyard_net::{EncryptedClient, NetworkError, SubSocket};
use switchyard_protocol::{
    BroadcastVerifier, ControlWord, HeartbeatRequest, HEARTBEAT_MARKER, TOPIC_REPLY, WELCOME,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Consecutive session failures tolerated before the agent gives up.
const MAX_RECOVERIES: usize = 3;

/// What the agent observed, for whoever embeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The master assigned (or confirmed) the tenant topic.
    Subscribed(String),
    /// The broadcast channel is up.
    Welcomed,
    /// A verified broadcast other than the protocol markers.
    Broadcast { topic: String, parts: Vec<String> },
}

pub struct HeartbeatAgent {
    client: EncryptedClient,
    subscriber: SubSocket,
    verifier: BroadcastVerifier,
    node: String,
    interval: Duration,
    topic: Option<String>,
    events: Option<mpsc::Sender<AgentEvent>>,
}

impl HeartbeatAgent {
    pub fn new(
        client: EncryptedClient,
        subscriber: SubSocket,
        verifier: BroadcastVerifier,
        node: &str,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            subscriber,
            verifier,
            node: node.to_string(),
            interval,
            topic: None,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    async fn beat(&mut self, control: ControlWord) -> Result<(), NetworkError> {
        tracing::debug!(node = %self.node, control = %control, "heartbeat");
        self.client.send(&HeartbeatRequest::parts(control)).await
    }

    /// Run until cancelled. Leaves the tenant with `FINISHED` on the way out.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), NetworkError> {
        // Our own name is not a tenant topic, so the master greets it; that
        // confirms the broadcast path before any tenant traffic.
        self.subscriber.subscribe(self.node.as_bytes()).await?;
        self.beat(ControlWord::Ident).await?;

        let start = tokio::time::Instant::now() + self.interval;
        let mut tick = tokio::time::interval_at(start, self.interval);
        let mut recoveries = 0;
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.beat(ControlWord::Ident).await,
                reply = self.client.recv() => match reply {
                    Ok(parts) => self.on_reply(parts).await,
                    Err(e) => Err(e),
                },
                broadcast = self.subscriber.recv() => self.on_broadcast(broadcast?).await,
            };
            match step {
                Ok(()) => recoveries = 0,
                Err(NetworkError::Connection(e)) if recoveries < MAX_RECOVERIES => {
                    recoveries += 1;
                    tracing::warn!(node = %self.node, error = %e, attempt = recoveries, "session failed, reconnecting");
                    self.client.reconnect().await?;
                    self.beat(ControlWord::Ident).await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.beat(ControlWord::Finished).await?;
        self.client.close().await?;
        tracing::info!(node = %self.node, "node agent stopped");
        Ok(())
    }

    async fn on_reply(&mut self, parts: Vec<String>) -> Result<(), NetworkError> {
        let [word, topic] = parts.as_slice() else {
            tracing::warn!(parts = parts.len(), "unexpected reply from master");
            return Ok(());
        };
        if word != TOPIC_REPLY {
            tracing::warn!(word = %word, "unexpected reply from master");
            return Ok(());
        }
        if self.topic.as_deref() != Some(topic.as_str()) {
            if let Some(old) = self.topic.take() {
                self.subscriber.unsubscribe(old.as_bytes()).await?;
            }
            self.subscriber.subscribe(topic.as_bytes()).await?;
            tracing::info!(node = %self.node, topic = %topic, "subscribed to tenant topic");
            self.topic = Some(topic.clone());
        }
        self.emit(AgentEvent::Subscribed(topic.clone())).await;
        Ok(())
    }

    async fn on_broadcast(&mut self, frames: Vec<Vec<u8>>) -> Result<(), NetworkError> {
        let [topic, payload] = frames.as_slice() else {
            tracing::warn!(frames = frames.len(), "malformed broadcast");
            return Ok(());
        };
        let topic = String::from_utf8_lossy(topic).into_owned();
        let parts = match self.verifier.decrypt(payload) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "broadcast failed verification, dropped");
                return Ok(());
            }
        };
        match parts.first().map(String::as_str) {
            Some(HEARTBEAT_MARKER) => self.beat(ControlWord::Reload).await?,
            Some(WELCOME) => {
                tracing::info!(node = %self.node, "broadcast channel up");
                self.emit(AgentEvent::Welcomed).await;
            }
            _ => {
                tracing::debug!(topic = %topic, parts = parts.len(), "broadcast received");
                self.emit(AgentEvent::Broadcast { topic, parts }).await;
            }
        }
        Ok(())
    }
}
