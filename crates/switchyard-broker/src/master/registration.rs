//! Master side of node registration.
//!
//! Requests are screened here (missing CSR, forbidden name, unparsable CSR,
//! CN mismatch) before anything reaches the [`CertController`], which owns
//! the actual signing decision.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use switchyard_protocol::{
    pki, CertBundle, RegisterRequest, RegistrationReply, RejectionCode,
};

use crate::RegistrationError;

/// Outcome of handing a CSR to the signing authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertDecision {
    Pending,
    Approved { node_cert: String, ca_cert: String },
    Rejected { code: RejectionCode, reason: Option<String> },
}

/// Boundary to the certificate-authority workflow. Implementations may
/// block; they are called off the async runtime.
pub trait CertController: Send {
    /// Called on every REGISTER carrying a screened CSR. Must be idempotent:
    /// a node keeps resubmitting the same CSR while the decision is pending.
    fn submit(&mut self, node: &str, csr_pem: &str) -> Result<CertDecision, RegistrationError>;
}

/// Drop-directory controller for an out-of-band operator signing flow.
///
/// ```text
/// <dir>/pending/<node>.csr    written here, picked up by the operator
/// <dir>/issued/<node>.crt     signed certificate, written by the operator
/// <dir>/rejected/<node>       optional reason, written by the operator
/// <dir>/ca.crt                issuing CA
/// ```
pub struct FileCertController {
    dir: PathBuf,
}

impl FileCertController {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RegistrationError> {
        let dir = dir.into();
        for sub in ["pending", "issued", "rejected"] {
            let path = dir.join(sub);
            std::fs::create_dir_all(&path)
                .map_err(|source| RegistrationError::Storage { path, source })?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pending_path(&self, node: &str) -> PathBuf {
        self.dir.join("pending").join(format!("{node}.csr"))
    }

    fn issued_path(&self, node: &str) -> PathBuf {
        self.dir.join("issued").join(format!("{node}.crt"))
    }

    fn rejected_path(&self, node: &str) -> PathBuf {
        self.dir.join("rejected").join(node)
    }

    fn read(path: &Path) -> Result<String, RegistrationError> {
        std::fs::read_to_string(path).map_err(|source| RegistrationError::Storage {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl CertController for FileCertController {
    fn submit(&mut self, node: &str, csr_pem: &str) -> Result<CertDecision, RegistrationError> {
        let rejected = self.rejected_path(node);
        if rejected.exists() {
            let reason = Self::read(&rejected)?.trim().to_string();
            let _ = std::fs::remove_file(&rejected);
            let _ = std::fs::remove_file(self.pending_path(node));
            return Ok(CertDecision::Rejected {
                code: RejectionCode::ApprovalFailed,
                reason: (!reason.is_empty()).then_some(reason),
            });
        }

        let issued = self.issued_path(node);
        if issued.exists() {
            let node_cert = Self::read(&issued)?;
            let ca_cert = Self::read(&self.dir.join("ca.crt"))?;
            return match pki::verify_issued(csr_pem, &node_cert, &ca_cert) {
                Ok(()) => {
                    let _ = std::fs::remove_file(self.pending_path(node));
                    Ok(CertDecision::Approved { node_cert, ca_cert })
                }
                // Issued for some other key: the name is taken.
                Err(_) => Ok(CertDecision::Rejected {
                    code: RejectionCode::CertExists,
                    reason: None,
                }),
            };
        }

        let pending = self.pending_path(node);
        let unchanged = std::fs::read_to_string(&pending).is_ok_and(|existing| existing == csr_pem);
        if !unchanged {
            std::fs::write(&pending, csr_pem)
                .map_err(|source| RegistrationError::Storage { path: pending.clone(), source })?;
            tracing::info!(node, path = %pending.display(), "CSR waiting for approval");
        }
        Ok(CertDecision::Pending)
    }
}

/// Screens REGISTER requests and turns controller decisions into replies.
pub struct RegistrationService {
    controller: Arc<Mutex<Box<dyn CertController>>>,
    server_cert_pem: String,
    forbidden: Vec<String>,
}

impl RegistrationService {
    pub fn new(
        controller: Box<dyn CertController>,
        server_cert_pem: String,
        forbidden: Vec<String>,
    ) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
            server_cert_pem,
            forbidden,
        }
    }

    fn is_forbidden(&self, node: &str) -> bool {
        node.is_empty()
            || node.starts_with('.')
            || node.contains(['/', '\\', '\0'])
            || self.forbidden.iter().any(|f| f.eq_ignore_ascii_case(node))
    }

    async fn submit(&self, req: &RegisterRequest) -> Result<CertDecision, RegistrationError> {
        let controller = Arc::clone(&self.controller);
        let (node, csr_pem) = (req.node.clone(), req.csr_pem.clone());
        tokio::task::spawn_blocking(move || {
            let mut controller = controller
                .lock()
                .map_err(|_| RegistrationError::Controller("controller lock poisoned".into()))?;
            controller.submit(&node, &csr_pem)
        })
        .await
        .map_err(|e| RegistrationError::Controller(format!("controller task failed: {e}")))?
    }

    pub async fn handle(&self, req: &RegisterRequest) -> RegistrationReply {
        if req.csr_pem.trim().is_empty() {
            return RegistrationReply::SendCsr;
        }
        if self.is_forbidden(&req.node) {
            tracing::warn!(node = %req.node, "registration under a forbidden name");
            return RegistrationReply::rejected(RejectionCode::ForbiddenName);
        }
        let cn = match pki::csr_common_name(&req.csr_pem) {
            Ok(cn) => cn,
            Err(e) => {
                tracing::warn!(node = %req.node, error = %e, "unparsable CSR");
                return RegistrationReply::rejected(RejectionCode::InvalidCsr);
            }
        };
        if cn != req.node {
            tracing::warn!(node = %req.node, cn = %cn, "CSR common name does not match node name");
            return RegistrationReply::rejected(RejectionCode::CnMismatch);
        }

        match self.submit(req).await {
            Ok(CertDecision::Pending) => RegistrationReply::Pending,
            Ok(CertDecision::Approved { node_cert, ca_cert }) => {
                tracing::info!(node = %req.node, "registration approved");
                RegistrationReply::Approved(CertBundle {
                    node_cert,
                    ca_cert,
                    server_cert: self.server_cert_pem.clone(),
                })
            }
            Ok(CertDecision::Rejected { code, reason }) => {
                tracing::warn!(node = %req.node, code = %code, "registration rejected");
                RegistrationReply::Rejected { code, reason }
            }
            Err(e) => {
                tracing::error!(node = %req.node, error = %e, "certificate controller failed");
                RegistrationReply::Rejected {
                    code: RejectionCode::ApprovalFailed,
                    reason: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_protocol::pki::NodeCertRequest;
    use switchyard_protocol::testing::TestAuthority;

    struct Fixed(CertDecision);

    impl CertController for Fixed {
        fn submit(&mut self, _: &str, _: &str) -> Result<CertDecision, RegistrationError> {
            Ok(self.0.clone())
        }
    }

    fn service(decision: CertDecision) -> RegistrationService {
        RegistrationService::new(
            Box::new(Fixed(decision)),
            "SERVER".into(),
            vec!["master".into()],
        )
    }

    fn register(node: &str, csr_pem: &str) -> RegisterRequest {
        RegisterRequest {
            node: node.into(),
            csr_pem: csr_pem.into(),
        }
    }

    struct Failing;

    impl CertController for Failing {
        fn submit(&mut self, _: &str, _: &str) -> Result<CertDecision, RegistrationError> {
            panic!("controller crashed");
        }
    }

    #[tokio::test]
    async fn test_screening_order() {
        let svc = service(CertDecision::Pending);
        assert_eq!(svc.handle(&register("n1", "")).await, RegistrationReply::SendCsr);

        let csr = NodeCertRequest::new("master", "Alpha").unwrap();
        assert_eq!(
            svc.handle(&register("Master", csr.csr_pem())).await,
            RegistrationReply::rejected(RejectionCode::ForbiddenName)
        );
        assert_eq!(
            svc.handle(&register("../etc", csr.csr_pem())).await,
            RegistrationReply::rejected(RejectionCode::ForbiddenName)
        );
        assert_eq!(
            svc.handle(&register("n1", "-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n")).await,
            RegistrationReply::rejected(RejectionCode::InvalidCsr)
        );
        let other = NodeCertRequest::new("n2", "Alpha").unwrap();
        assert_eq!(
            svc.handle(&register("n1", other.csr_pem())).await,
            RegistrationReply::rejected(RejectionCode::CnMismatch)
        );
        let good = NodeCertRequest::new("n1", "Alpha").unwrap();
        assert_eq!(svc.handle(&register("n1", good.csr_pem())).await, RegistrationReply::Pending);
    }

    #[tokio::test]
    async fn test_approval_carries_server_cert() {
        let svc = service(CertDecision::Approved {
            node_cert: "NODE".into(),
            ca_cert: "CA".into(),
        });
        let csr = NodeCertRequest::new("n1", "Alpha").unwrap();
        let RegistrationReply::Approved(bundle) = svc.handle(&register("n1", csr.csr_pem())).await else {
            panic!("expected approval");
        };
        assert_eq!(bundle.server_cert, "SERVER");
    }

    #[tokio::test]
    async fn test_controller_crash_becomes_rejection() {
        let svc = RegistrationService::new(Box::new(Failing), "SERVER".into(), Vec::new());
        let csr = NodeCertRequest::new("n1", "Alpha").unwrap();
        let RegistrationReply::Rejected { code, reason } = svc.handle(&register("n1", csr.csr_pem())).await
        else {
            panic!("expected rejection");
        };
        assert_eq!(code, RejectionCode::ApprovalFailed);
        assert!(reason.is_some_and(|r| r.contains("controller")));
    }

    #[test]
    fn test_file_controller_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestAuthority::new("Ops CA");
        std::fs::write(dir.path().join("ca.crt"), ca.cert_pem()).unwrap();
        let mut controller = FileCertController::new(dir.path()).unwrap();

        let csr = NodeCertRequest::new("n1", "Alpha").unwrap();
        assert_eq!(controller.submit("n1", csr.csr_pem()).unwrap(), CertDecision::Pending);
        let filed = std::fs::read_to_string(dir.path().join("pending/n1.csr")).unwrap();
        assert_eq!(filed, csr.csr_pem());

        // Operator signs.
        std::fs::write(dir.path().join("issued/n1.crt"), ca.sign_csr(&filed)).unwrap();
        let CertDecision::Approved { ca_cert, .. } = controller.submit("n1", csr.csr_pem()).unwrap()
        else {
            panic!("expected approval");
        };
        assert_eq!(ca_cert, ca.cert_pem());
        assert!(!dir.path().join("pending/n1.csr").exists());

        // Someone else asking for the same name with a different key.
        let intruder = NodeCertRequest::new("n1", "Alpha").unwrap();
        assert_eq!(
            controller.submit("n1", intruder.csr_pem()).unwrap(),
            CertDecision::Rejected {
                code: RejectionCode::CertExists,
                reason: None
            }
        );
    }

    #[test]
    fn test_file_controller_rejection_reason() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = FileCertController::new(dir.path()).unwrap();
        let csr = NodeCertRequest::new("n9", "Alpha").unwrap();
        controller.submit("n9", csr.csr_pem()).unwrap();
        std::fs::write(dir.path().join("rejected/n9"), "unknown host\n").unwrap();
        assert_eq!(
            controller.submit("n9", csr.csr_pem()).unwrap(),
            CertDecision::Rejected {
                code: RejectionCode::ApprovalFailed,
                reason: Some("unknown host".into())
            }
        );
        assert!(!dir.path().join("rejected/n9").exists());
    }
}
