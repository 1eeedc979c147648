//! Liveness worker: sole owner of the tenant registry.
//!
//! Handles heartbeats and departures forwarded by the router and
//! subscription changes reported by the relay. Every heartbeat interval it
//! sweeps stale nodes and publishes a heartbeat marker on each tenant topic.

use chrono::{DateTime, Utc};
use switchyard_net::AdapterHandle;
use switchyard_protocol::{
    HeartbeatRequest, PeerIdentity, HEARTBEAT_MARKER, SUBSCRIBE_ACTION, TOPIC_REPLY,
    UNSUBSCRIBE_ACTION, WELCOME,
};
use switchyard_tenancy::{HeartbeatOutcome, TenantRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::relay::RelayCommand;

#[derive(Debug, Clone, PartialEq)]
pub enum LivenessCommand {
    Heartbeat(HeartbeatRequest),
    /// The connection of an authenticated node went away.
    Departed { peer: String, org: String },
    /// Raw subscription frame from the pub socket: action byte, then topic.
    Subscription(Vec<u8>),
}

/// Side effects of one command, carried out by [`LivenessWorker::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum LivenessEffect {
    Reply(PeerIdentity, Vec<String>),
    Publish(RelayCommand),
}

pub struct LivenessWorker {
    registry: TenantRegistry,
    commands: mpsc::Receiver<LivenessCommand>,
    adapter: AdapterHandle,
    relay: mpsc::Sender<RelayCommand>,
}

impl LivenessWorker {
    pub fn new(
        registry: TenantRegistry,
        commands: mpsc::Receiver<LivenessCommand>,
        adapter: AdapterHandle,
        relay: mpsc::Sender<RelayCommand>,
    ) -> Self {
        Self {
            registry,
            commands,
            adapter,
            relay,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let interval = self.registry.interval();
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let effects = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => heartbeat_cycle(&mut self.registry, Utc::now()),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => apply(&mut self.registry, cmd, Utc::now()),
                    None => break,
                },
            };
            for effect in effects {
                self.perform(effect).await;
            }
        }
        tracing::info!("liveness worker stopped");
    }

    async fn perform(&self, effect: LivenessEffect) {
        match effect {
            LivenessEffect::Reply(ident, parts) => {
                if let Err(e) = self.adapter.reply(ident, parts).await {
                    tracing::warn!(error = %e, "heartbeat reply not queued");
                }
            }
            LivenessEffect::Publish(cmd) => {
                if self.relay.send(cmd).await.is_err() {
                    tracing::warn!("relay stopped, broadcast dropped");
                }
            }
        }
    }
}

/// Sweep stale nodes, then mark every tenant topic.
pub fn heartbeat_cycle(registry: &mut TenantRegistry, now: DateTime<Utc>) -> Vec<LivenessEffect> {
    let evicted = registry.sweep(now);
    if !evicted.is_empty() {
        tracing::info!(count = evicted.len(), "liveness sweep evicted nodes");
    }
    registry
        .topics()
        .map(|topic| {
            LivenessEffect::Publish(RelayCommand {
                topic: topic.to_string(),
                parts: vec![HEARTBEAT_MARKER.to_string()],
            })
        })
        .collect()
}

pub fn apply(
    registry: &mut TenantRegistry,
    cmd: LivenessCommand,
    now: DateTime<Utc>,
) -> Vec<LivenessEffect> {
    match cmd {
        LivenessCommand::Heartbeat(req) => match registry.heartbeat(&req, now) {
            HeartbeatOutcome::Subscribe { topic } => vec![LivenessEffect::Reply(
                req.ident,
                vec![TOPIC_REPLY.to_string(), topic],
            )],
            HeartbeatOutcome::Left | HeartbeatOutcome::UnknownOrg => Vec::new(),
        },
        LivenessCommand::Departed { peer, org } => {
            if registry.remove_node(&peer, &org) {
                tracing::info!(peer = %peer, org = %org, "node disconnected");
            }
            Vec::new()
        }
        LivenessCommand::Subscription(frame) => {
            let Some((&action, topic)) = frame.split_first() else {
                return Vec::new();
            };
            let name = String::from_utf8_lossy(topic).into_owned();
            match action {
                SUBSCRIBE_ACTION if !registry.is_known_topic(topic) => {
                    tracing::debug!(topic = %name, "subscription to a non-tenant topic, greeting");
                    vec![LivenessEffect::Publish(RelayCommand {
                        topic: name,
                        parts: vec![WELCOME.to_string()],
                    })]
                }
                SUBSCRIBE_ACTION => {
                    tracing::debug!(topic = %name, "tenant topic subscribed");
                    Vec::new()
                }
                UNSUBSCRIBE_ACTION => {
                    tracing::debug!(topic = %name, "topic unsubscribed");
                    Vec::new()
                }
                other => {
                    tracing::warn!(action = other, "unknown subscription action");
                    Vec::new()
                }
            }
        }
    }
}
