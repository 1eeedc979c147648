//! Router/dispatcher.
//!
//! Takes decrypted messages from the adapter, enforces the admin-only rule
//! for anonymous peers and hands each request to its target: registration
//! and heartbeat are served in-process, anything else goes to the worker
//! socket under the target's name. Worker replies go back to the peer they
//! name.

use switchyard_net::{AdapterEvent, AdapterHandle, RouterSocket};
use switchyard_protocol::{
    parse_reply, parse_request, ClientRequest, HeartbeatRequest, Inbound, PeerClaims,
    PeerIdentity, RegisterRequest, ADMIN_TOPIC, HEARTBEAT_TARGET,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::heartbeat::LivenessCommand;
use super::registration::RegistrationService;

/// Where an admitted request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Registration,
    Heartbeat,
    Worker(String),
}

/// Anonymous peers may only reach the administrative topic.
pub fn admits(req: &ClientRequest) -> bool {
    req.claims.is_some() || req.is_admin()
}

pub fn route_for(req: &ClientRequest) -> Route {
    match req.target.as_str() {
        ADMIN_TOPIC => Route::Registration,
        HEARTBEAT_TARGET => Route::Heartbeat,
        other => Route::Worker(other.to_string()),
    }
}

pub struct Router {
    adapter: AdapterHandle,
    events: mpsc::Receiver<AdapterEvent>,
    workers: RouterSocket,
    registration: RegistrationService,
    liveness: mpsc::Sender<LivenessCommand>,
}

impl Router {
    pub fn new(
        adapter: AdapterHandle,
        events: mpsc::Receiver<AdapterEvent>,
        workers: RouterSocket,
        registration: RegistrationService,
        liveness: mpsc::Sender<LivenessCommand>,
    ) -> Self {
        Self {
            adapter,
            events,
            workers,
            registration,
            liveness,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(AdapterEvent::Message { ident, claims, message }) => {
                        self.on_message(ident, claims, &message).await;
                    }
                    Some(AdapterEvent::Departed { ident, claims }) => {
                        self.on_departed(ident, claims).await;
                    }
                    None => {
                        tracing::warn!("adapter stopped, router stopping");
                        break;
                    }
                },
                reply = self.workers.recv() => match reply {
                    Some((worker, frames)) => self.on_worker_reply(worker, frames).await,
                    None => {
                        tracing::warn!("worker socket closed, router stopping");
                        break;
                    }
                },
            }
        }
        tracing::info!("router stopped");
    }

    async fn on_message(&mut self, ident: PeerIdentity, claims: Option<PeerClaims>, message: &[u8]) {
        let req = match parse_request(ident, claims, message) {
            Inbound::Request(req) => req,
            Inbound::Malformed(reason) => {
                tracing::warn!(reason = %reason, "malformed request dropped");
                return;
            }
            Inbound::Reply(_) => return,
        };
        if !admits(&req) {
            tracing::warn!(peer = %req.ident, target = %req.target, "anonymous peer outside admin topic, dropped");
            return;
        }

        match route_for(&req) {
            Route::Registration => {
                let reply = match RegisterRequest::from_request(&req) {
                    Ok(register) => self.registration.handle(&register).await.to_parts(),
                    Err(e) => {
                        tracing::warn!(peer = %req.ident, error = %e, "bad admin request");
                        return;
                    }
                };
                self.reply(req.ident, reply).await;
            }
            Route::Heartbeat => match HeartbeatRequest::from_request(&req) {
                Ok(hb) => {
                    if self.liveness.send(LivenessCommand::Heartbeat(hb)).await.is_err() {
                        tracing::warn!("liveness worker gone, heartbeat dropped");
                    }
                }
                Err(e) => tracing::warn!(peer = %req.ident, error = %e, "bad heartbeat"),
            },
            Route::Worker(target) => {
                let worker = match PeerIdentity::new(target.as_bytes().to_vec()) {
                    Ok(worker) => worker,
                    Err(e) => {
                        tracing::warn!(target = %target, error = %e, "invalid worker target");
                        return;
                    }
                };
                if let Err(e) = self.workers.send(&worker, req.to_worker_frames()).await {
                    tracing::warn!(target = %target, peer = %req.ident, error = %e, "no worker for target");
                }
            }
        }
    }

    async fn on_departed(&mut self, ident: PeerIdentity, claims: Option<PeerClaims>) {
        let Some(claims) = claims else {
            return;
        };
        tracing::debug!(peer = %ident, client = %claims.client_id, "authenticated peer departed");
        let cmd = LivenessCommand::Departed {
            peer: claims.client_id,
            org: claims.org_id,
        };
        if self.liveness.send(cmd).await.is_err() {
            tracing::debug!("liveness worker gone, departure dropped");
        }
    }

    async fn on_worker_reply(&mut self, worker: PeerIdentity, frames: Vec<Vec<u8>>) {
        match parse_reply(&frames) {
            Inbound::Reply(reply) => self.reply(reply.ident, reply.parts).await,
            Inbound::Malformed(reason) => {
                tracing::warn!(worker = %worker, reason = %reason, "malformed worker reply dropped");
            }
            Inbound::Request(_) => {}
        }
    }

    async fn reply(&self, ident: PeerIdentity, parts: Vec<String>) {
        if let Err(e) = self.adapter.reply(ident, parts).await {
            tracing::warn!(error = %e, "reply not queued");
        }
    }
}
