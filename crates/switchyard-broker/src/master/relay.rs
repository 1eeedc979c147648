//! Pub/sub relay: signs and publishes broadcasts, and reports subscription
//! changes to the liveness worker.

use switchyard_net::PubSocket;
use switchyard_protocol::BroadcastSigner;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::heartbeat::LivenessCommand;

/// Publish `parts` on `topic`, signed with the broker key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub topic: String,
    pub parts: Vec<String>,
}

pub struct Relay {
    publisher: PubSocket,
    signer: BroadcastSigner,
    commands: mpsc::Receiver<RelayCommand>,
    liveness: mpsc::Sender<LivenessCommand>,
}

impl Relay {
    pub fn new(
        publisher: PubSocket,
        signer: BroadcastSigner,
        commands: mpsc::Receiver<RelayCommand>,
        liveness: mpsc::Sender<LivenessCommand>,
    ) -> Self {
        Self {
            publisher,
            signer,
            commands,
            liveness,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.publish(cmd).await,
                    None => break,
                },
                event = self.publisher.next_event() => match event {
                    // The liveness worker also feeds this task, so never wait on it.
                    Some(frame) => match self.liveness.try_send(LivenessCommand::Subscription(frame)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!("liveness queue full, subscription event dropped");
                        }
                        Err(TrySendError::Closed(_)) => {
                            tracing::debug!("liveness worker gone, subscription event dropped");
                        }
                    },
                    None => {
                        tracing::warn!("publish socket closed, relay stopping");
                        break;
                    }
                },
            }
        }
        tracing::info!("relay stopped");
    }

    async fn publish(&self, cmd: RelayCommand) {
        let payload = match self.signer.encrypt(&cmd.parts) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(topic = %cmd.topic, error = %e, "cannot sign broadcast");
                return;
            }
        };
        let delivered = self.publisher.publish(cmd.topic.as_bytes(), &payload).await;
        tracing::debug!(topic = %cmd.topic, subscribers = delivered, "broadcast published");
    }
}
