//! Master composition root.
//!
//! Builds the TLS context and broadcast signer once, binds the public
//! adapter, the publish socket and the worker socket, then runs the adapter,
//! router, liveness worker and relay as separate tasks sharing one
//! cancellation token.

pub mod heartbeat;
pub mod registration;
pub mod relay;
pub mod router;

use std::time::Duration;

use anyhow::Context;
use switchyard_net::{
    AdapterConfig, AdapterEvent, AdapterHandle, EncryptedAdapter, Endpoint, PubSocket,
    RouterSocket, ServerTlsContext,
};
use switchyard_protocol::BroadcastSigner;
use switchyard_tenancy::TenantRegistry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SwitchyardConfig;
use heartbeat::LivenessWorker;
use registration::{CertController, FileCertController, RegistrationService};
use relay::Relay;
use router::Router;

const COMMAND_QUEUE: usize = 256;

/// A bound but not yet running master.
pub struct Master {
    adapter: EncryptedAdapter,
    handle: AdapterHandle,
    events: mpsc::Receiver<AdapterEvent>,
    publisher: PubSocket,
    workers: RouterSocket,
    signer: BroadcastSigner,
    registry: TenantRegistry,
    registration: RegistrationService,
}

impl Master {
    /// Bind every socket using the file-drop certificate controller.
    pub async fn bind(config: &SwitchyardConfig) -> anyhow::Result<Self> {
        let controller = FileCertController::new(&config.master.requests_dir)
            .context("certificate request directory is not usable")?;
        Self::bind_with(config, Box::new(controller)).await
    }

    pub async fn bind_with(
        config: &SwitchyardConfig,
        controller: Box<dyn CertController>,
    ) -> anyhow::Result<Self> {
        let settings = config.tls_settings();
        let tls = ServerTlsContext::from_settings(&settings).context("server TLS context")?;

        let (cert_file, key_file) = settings
            .cert_file
            .as_ref()
            .zip(settings.key_file.as_ref())
            .context("master needs security.cert and security.key")?;
        let server_cert_pem = std::fs::read_to_string(cert_file)
            .with_context(|| format!("read {}", cert_file.display()))?;
        let key_pem = std::fs::read_to_string(key_file)
            .with_context(|| format!("read {}", key_file.display()))?;
        let signer = BroadcastSigner::from_pkcs8_pem(&key_pem, settings.passphrase.as_deref())
            .context("broadcast signing key (the master key must be Ed25519)")?;

        let registry = if config.tenancy.multi_tenant {
            TenantRegistry::from_orgs(&config.tenancy.organizations, config.heartbeat_interval())?
        } else {
            TenantRegistry::single(config.heartbeat_interval())?
        };

        std::fs::create_dir_all(&config.sock_dir)
            .with_context(|| format!("socket directory {}", config.sock_dir.display()))?;

        let mut adapter_config = AdapterConfig::new(config.listen_endpoint()?);
        adapter_config.anonymous_idle_timeout = Duration::from_secs(config.master.anonymous_idle_secs);
        let (adapter, handle, events) = EncryptedAdapter::bind(adapter_config, tls)
            .await
            .context("bind node listener")?;
        let publisher = PubSocket::bind(&config.publish_endpoint()?)
            .await
            .context("bind publish socket")?;
        let workers = RouterSocket::bind(&config.worker_endpoint()?)
            .await
            .context("bind worker socket")?;

        let registration = RegistrationService::new(
            controller,
            server_cert_pem,
            config.master.forbidden_names.clone(),
        );

        Ok(Self {
            adapter,
            handle,
            events,
            publisher,
            workers,
            signer,
            registry,
            registration,
        })
    }

    pub fn listen_endpoint(&self) -> &Endpoint {
        self.handle.endpoint()
    }

    pub fn publish_endpoint(&self) -> &Endpoint {
        self.publisher.endpoint()
    }

    pub fn worker_endpoint(&self) -> &Endpoint {
        self.workers.endpoint()
    }

    /// Run until `cancel` fires, then wait for every task to wind down.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (liveness_tx, liveness_rx) = mpsc::channel(COMMAND_QUEUE);
        let (relay_tx, relay_rx) = mpsc::channel(COMMAND_QUEUE);

        tracing::info!(
            listen = %self.handle.endpoint(),
            publish = %self.publisher.endpoint(),
            workers = %self.workers.endpoint(),
            multi_tenant = self.registry.is_multi_tenant(),
            "master running"
        );

        let router = Router::new(
            self.handle.clone(),
            self.events,
            self.workers,
            self.registration,
            liveness_tx.clone(),
        );
        let liveness = LivenessWorker::new(self.registry, liveness_rx, self.handle, relay_tx);
        let relay = Relay::new(self.publisher, self.signer, relay_rx, liveness_tx);

        let tasks = [
            tokio::spawn(self.adapter.run(cancel.clone())),
            tokio::spawn(router.run(cancel.clone())),
            tokio::spawn(liveness.run(cancel.clone())),
            tokio::spawn(relay.run(cancel.clone())),
        ];

        cancel.cancelled().await;
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "master task panicked");
            }
        }
        tracing::info!("master stopped");
        Ok(())
    }
}

/// `switchyard master`
pub async fn run(config: &SwitchyardConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    Master::bind(config).await?.run(cancel).await
}
