//! Node runtime: `switchyard node register` and `switchyard node run`.

pub mod agent;
pub mod registration;

use std::time::Duration;

use anyhow::Context;
use switchyard_net::{ClientTlsContext, EncryptedClient, SubSocket, TlsSettings};
use switchyard_protocol::{BroadcastVerifier, PeerIdentity};
use tokio_util::sync::CancellationToken;

use crate::config::SwitchyardConfig;
use agent::HeartbeatAgent;
use registration::{EncryptedTransport, InstalledCerts, RegistrationClient};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Routing identity: the node name, when it fits.
fn identity_for(node: &str) -> Option<PeerIdentity> {
    PeerIdentity::new(node.as_bytes().to_vec()).ok()
}

/// Register with the master and install the issued certificates.
pub async fn register(config: &SwitchyardConfig) -> anyhow::Result<InstalledCerts> {
    let node = &config.node;
    let installed = InstalledCerts::in_dir(&node.cert_dir);
    if installed.exist() {
        anyhow::bail!(
            "node is already registered (certificates in {})",
            node.cert_dir.display()
        );
    }

    // No client certificate yet; the master is verified if a CA is configured.
    let tls = ClientTlsContext::from_settings(&TlsSettings {
        ca_files: config.security.ca.clone(),
        verify_depth: config.security.verify_depth,
        ..TlsSettings::default()
    })
    .context("client TLS context")?;
    let client = EncryptedClient::connect(&config.master_endpoint()?, identity_for(&node.name), tls)
        .await
        .context("connect to master")?;

    let mut registration = RegistrationClient::new(
        EncryptedTransport::new(client, CALL_TIMEOUT),
        &node.name,
        &node.organization,
        &node.cert_dir,
    )
    .with_retry(
        Duration::from_secs(node.retry_secs),
        Duration::from_secs(node.approval_timeout_secs),
    );
    let outcome = registration.register().await;
    if let Err(e) = registration.into_transport().close().await {
        tracing::debug!(error = %e, "registration session close failed");
    }
    Ok(outcome?)
}

/// Run the heartbeat agent with the installed identity until cancelled.
pub async fn run(config: &SwitchyardConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let node = &config.node;
    let installed = InstalledCerts::in_dir(&node.cert_dir);
    if !installed.exist() {
        anyhow::bail!(
            "no node certificates in {}; run `switchyard node register` first",
            node.cert_dir.display()
        );
    }

    let tls = ClientTlsContext::from_settings(&TlsSettings {
        cert_file: Some(installed.node_cert.clone()),
        key_file: Some(installed.node_key.clone()),
        ca_files: vec![installed.ca_cert.clone()],
        passphrase: None,
        verify_depth: config.security.verify_depth,
    })
    .context("node TLS context")?;

    let server_cert = std::fs::read_to_string(&installed.server_cert)
        .with_context(|| format!("read {}", installed.server_cert.display()))?;
    let verifier =
        BroadcastVerifier::from_certificate_pem(&server_cert).context("broadcast verifier")?;

    let client = EncryptedClient::connect(&config.master_endpoint()?, identity_for(&node.name), tls)
        .await
        .context("connect to master")?;
    let subscriber = SubSocket::connect(&config.subscribe_endpoint()?)
        .await
        .context("connect to publish socket")?;

    tracing::info!(node = %node.name, master = %node.master, "node running");
    HeartbeatAgent::new(client, subscriber, verifier, &node.name, config.heartbeat_interval())
        .run(cancel)
        .await?;
    Ok(())
}
