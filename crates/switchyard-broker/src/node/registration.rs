//! Node side of registration.
//!
//! Sends `[admin, REGISTER, name, csr]` until the master answers with a
//! terminal reply. `PENDING` and `SEND_CSR` are retried on a fixed interval
//! until the approval timeout. An approval is verified against the CSR and
//! the CA before anything is written to the certificate directory.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use switchyard_net::{EncryptedClient, NetworkError};
use switchyard_protocol::pki::{self, NodeCertRequest};
use switchyard_protocol::{CertBundle, RegisterRequest, RegistrationReply};
use tokio::time::Instant;

use crate::RegistrationError;

pub const NODE_CERT_FILE: &str = "node.crt";
pub const NODE_KEY_FILE: &str = "node.key";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const SERVER_CERT_FILE: &str = "server.crt";

/// One request/reply exchange with the master's admin topic.
pub trait RegistrationTransport {
    fn exchange(
        &mut self,
        parts: Vec<String>,
    ) -> impl Future<Output = Result<Vec<String>, NetworkError>> + Send;
}

/// Anonymous encrypted session to the master. The master drops an anonymous
/// connection after answering it, so each attempt after the first starts a
/// new session.
pub struct EncryptedTransport {
    client: EncryptedClient,
    timeout: Duration,
    used: bool,
}

impl EncryptedTransport {
    pub fn new(client: EncryptedClient, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            used: false,
        }
    }

    pub async fn close(self) -> Result<(), NetworkError> {
        self.client.close().await
    }
}

impl RegistrationTransport for EncryptedTransport {
    async fn exchange(&mut self, parts: Vec<String>) -> Result<Vec<String>, NetworkError> {
        if self.used {
            self.client.reconnect().await?;
        }
        self.used = true;
        self.client.call(&parts, self.timeout).await
    }
}

/// Paths of an installed node identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledCerts {
    pub node_cert: PathBuf,
    pub node_key: PathBuf,
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
}

impl InstalledCerts {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            node_cert: dir.join(NODE_CERT_FILE),
            node_key: dir.join(NODE_KEY_FILE),
            ca_cert: dir.join(CA_CERT_FILE),
            server_cert: dir.join(SERVER_CERT_FILE),
        }
    }

    pub fn exist(&self) -> bool {
        [&self.node_cert, &self.node_key, &self.ca_cert, &self.server_cert]
            .iter()
            .all(|p| p.exists())
    }
}

pub struct RegistrationClient<T> {
    transport: T,
    node: String,
    organization: String,
    cert_dir: PathBuf,
    retry: Duration,
    approval_timeout: Duration,
}

impl<T: RegistrationTransport> RegistrationClient<T> {
    pub fn new(transport: T, node: &str, organization: &str, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            node: node.to_string(),
            organization: organization.to_string(),
            cert_dir: cert_dir.into(),
            retry: Duration::from_secs(switchyard_protocol::REGISTRATION_RETRY_SECS),
            approval_timeout: Duration::from_secs(switchyard_protocol::DEFAULT_APPROVAL_TIMEOUT_SECS),
        }
    }

    pub fn with_retry(mut self, retry: Duration, approval_timeout: Duration) -> Self {
        self.retry = retry;
        self.approval_timeout = approval_timeout;
        self
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Reuse a key left by an earlier run so a pending request stays valid.
    fn cert_request(&self) -> Result<NodeCertRequest, RegistrationError> {
        let key_path = self.cert_dir.join(NODE_KEY_FILE);
        let request = match std::fs::read_to_string(&key_path) {
            Ok(key_pem) => NodeCertRequest::from_key_pem(&self.node, &self.organization, &key_pem)?,
            Err(_) => NodeCertRequest::new(&self.node, &self.organization)?,
        };
        Ok(request)
    }

    pub async fn register(&mut self) -> Result<InstalledCerts, RegistrationError> {
        let request = self.cert_request()?;
        let register = RegisterRequest {
            node: self.node.clone(),
            csr_pem: request.csr_pem().to_string(),
        };
        let deadline = Instant::now() + self.approval_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let parts = self.transport.exchange(register.parts()).await?;
            let reply = RegistrationReply::from_parts(&parts)?;
            match reply {
                RegistrationReply::Approved(bundle) => {
                    tracing::info!(node = %self.node, attempt, "registration approved");
                    return self.install(&request, &bundle);
                }
                RegistrationReply::Rejected { code, reason } => {
                    let reason = reason.unwrap_or_else(|| code.describe().to_string());
                    return Err(RegistrationError::Rejected { code, reason });
                }
                RegistrationReply::Pending | RegistrationReply::SendCsr => {
                    if Instant::now() + self.retry > deadline {
                        return Err(RegistrationError::Timeout(self.approval_timeout));
                    }
                    tracing::info!(
                        node = %self.node,
                        attempt,
                        retry_in = ?self.retry,
                        "registration pending"
                    );
                    tokio::time::sleep(self.retry).await;
                }
            }
        }
    }

    fn install(
        &self,
        request: &NodeCertRequest,
        bundle: &CertBundle,
    ) -> Result<InstalledCerts, RegistrationError> {
        pki::verify_issued(request.csr_pem(), &bundle.node_cert, &bundle.ca_cert)
            .map_err(|e| RegistrationError::Verification(e.to_string()))?;
        pki::parse_pem(&bundle.server_cert)
            .map_err(|e| RegistrationError::Verification(format!("server certificate: {e}")))?;

        std::fs::create_dir_all(&self.cert_dir).map_err(|source| RegistrationError::Storage {
            path: self.cert_dir.clone(),
            source,
        })?;
        let installed = InstalledCerts::in_dir(&self.cert_dir);
        for (path, contents) in [
            (&installed.node_key, request.private_key_pem()),
            (&installed.node_cert, bundle.node_cert.as_str()),
            (&installed.ca_cert, bundle.ca_cert.as_str()),
            (&installed.server_cert, bundle.server_cert.as_str()),
        ] {
            write_file(path, contents)?;
        }
        tracing::info!(dir = %self.cert_dir.display(), "node certificates installed");
        Ok(installed)
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), RegistrationError> {
    std::fs::write(path, contents).map_err(|source| RegistrationError::Storage {
        path: path.to_path_buf(),
        source,
    })?;
    #[cfg(unix)]
    if path.file_name().is_some_and(|n| n == NODE_KEY_FILE) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
            RegistrationError::Storage {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}
