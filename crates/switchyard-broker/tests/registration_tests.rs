//! Node registration against scripted master replies.

use std::collections::VecDeque;
use std::time::Duration;

use switchyard_broker::node::registration::{
    InstalledCerts, RegistrationClient, RegistrationTransport, NODE_KEY_FILE,
};
use switchyard_broker::RegistrationError;
use switchyard_net::NetworkError;
use switchyard_protocol::pki::{self, NodeCertRequest};
use switchyard_protocol::testing::TestAuthority;
use switchyard_protocol::{CertBundle, RegistrationReply, RejectionCode};

/// Plays back one reply per exchange. `APPROVED` signs whatever CSR the node sent.
struct ScriptedMaster {
    authority: TestAuthority,
    server_cert: String,
    script: VecDeque<&'static str>,
    requests: Vec<Vec<String>>,
}

impl ScriptedMaster {
    fn new(script: &[&'static str]) -> Self {
        let authority = TestAuthority::new("Switchyard Test CA");
        let (server_cert, _) = authority.issue_server("master");
        Self {
            authority,
            server_cert,
            script: script.iter().copied().collect(),
            requests: Vec::new(),
        }
    }
}

impl RegistrationTransport for ScriptedMaster {
    async fn exchange(&mut self, parts: Vec<String>) -> Result<Vec<String>, NetworkError> {
        let step = self.script.pop_front().unwrap_or("PENDING");
        let reply = match step {
            "APPROVED" => RegistrationReply::Approved(CertBundle {
                node_cert: self.authority.sign_csr(&parts[3]),
                ca_cert: self.authority.cert_pem().to_string(),
                server_cert: self.server_cert.clone(),
            }),
            "PENDING" => RegistrationReply::Pending,
            "SEND_CSR" => RegistrationReply::SendCsr,
            code => RegistrationReply::rejected(RejectionCode::from_code(code).unwrap()),
        };
        self.requests.push(parts);
        Ok(reply.to_parts())
    }
}

fn client(
    script: &[&'static str],
    dir: &std::path::Path,
) -> RegistrationClient<ScriptedMaster> {
    RegistrationClient::new(ScriptedMaster::new(script), "n1", "Alpha", dir)
        .with_retry(Duration::from_millis(10), Duration::from_secs(5))
}

#[tokio::test]
async fn test_pending_then_approved_installs_certificates() {
    let dir = tempfile::tempdir().unwrap();
    let mut registration = client(&["PENDING", "PENDING", "APPROVED"], dir.path());

    let installed = registration.register().await.unwrap();
    assert_eq!(installed, InstalledCerts::in_dir(dir.path()));
    assert!(installed.exist());

    let master = registration.into_transport();
    assert_eq!(master.requests.len(), 3);
    for request in &master.requests {
        assert_eq!(&request[..3], ["admin", "REGISTER", "n1"]);
    }
    // The same CSR is resent on every attempt.
    assert!(master.requests.windows(2).all(|w| w[0][3] == w[1][3]));

    let node_cert = std::fs::read_to_string(&installed.node_cert).unwrap();
    let claims = pki::extract_claims(&pki::parse_pem(&node_cert).unwrap()).unwrap();
    assert_eq!(claims.client_id, "n1");
    assert_eq!(claims.org_id, "Alpha");
    assert_eq!(
        std::fs::read_to_string(&installed.ca_cert).unwrap(),
        master.authority.cert_pem()
    );
    assert_eq!(
        std::fs::read_to_string(&installed.server_cert).unwrap(),
        master.server_cert
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_installed_key_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let installed = client(&["APPROVED"], dir.path()).register().await.unwrap();
    let mode = std::fs::metadata(&installed.node_key).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_rejection_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let err = client(&["ERR_CN_FAIL"], dir.path())
        .register()
        .await
        .unwrap_err();

    match err {
        RegistrationError::Rejected { code, reason } => {
            assert_eq!(code, RejectionCode::CnMismatch);
            assert_eq!(reason, RejectionCode::CnMismatch.describe());
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_send_csr_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut registration = client(&["SEND_CSR", "APPROVED"], dir.path());
    registration.register().await.unwrap();
    assert_eq!(registration.into_transport().requests.len(), 2);
}

#[tokio::test]
async fn test_approval_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut registration = RegistrationClient::new(ScriptedMaster::new(&[]), "n1", "Alpha", dir.path())
        .with_retry(Duration::from_millis(20), Duration::from_millis(70));

    let err = registration.register().await.unwrap_err();
    assert!(matches!(err, RegistrationError::Timeout(_)), "{err:?}");
    assert!(!InstalledCerts::in_dir(dir.path()).exist());
}

#[tokio::test]
async fn test_existing_key_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let earlier = NodeCertRequest::new("n1", "Alpha").unwrap();
    std::fs::write(dir.path().join(NODE_KEY_FILE), earlier.private_key_pem()).unwrap();

    let installed = client(&["APPROVED"], dir.path()).register().await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&installed.node_key).unwrap(),
        earlier.private_key_pem()
    );
}
