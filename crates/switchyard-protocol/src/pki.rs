//! Certificate helpers shared by the master and the nodes.
//!
//! Nodes generate their own key pair and send only a CSR. The master hands
//! back the signed certificate together with the CA and server certificates;
//! the node checks that bundle against its original request before trusting
//! any of it. On the master side, the CN and Organization of a verified peer
//! certificate become the connection's [`PeerClaims`].

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use serde::{Deserialize, Serialize};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::ProtocolError;

/// Identity claims taken from a verified peer certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerClaims {
    /// Subject common name: the node name.
    pub client_id: String,
    /// Subject organization: the tenant the node belongs to.
    pub org_id: String,
}

/// Decode the first PEM block into DER bytes.
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>, ProtocolError> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| ProtocolError::Certificate(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

/// Decode a PKCS#8 private key PEM into DER, decrypting it with
/// `passphrase` when it is an `ENCRYPTED PRIVATE KEY`.
pub fn decode_private_key(
    pem_data: &str,
    passphrase: Option<&str>,
) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| ProtocolError::Crypto(format!("failed to parse key PEM: {e}")))?;
    match pem_obj.tag() {
        "ENCRYPTED PRIVATE KEY" => {
            let passphrase = passphrase.ok_or_else(|| {
                ProtocolError::Crypto("private key is encrypted but no passphrase is set".into())
            })?;
            let info = pkcs8::EncryptedPrivateKeyInfo::try_from(pem_obj.contents())
                .map_err(|e| ProtocolError::Crypto(format!("encrypted key: {e}")))?;
            let doc = info
                .decrypt(passphrase)
                .map_err(|e| ProtocolError::Crypto(format!("failed to decrypt key: {e}")))?;
            Ok(Zeroizing::new(doc.as_bytes().to_vec()))
        }
        "PRIVATE KEY" => Ok(Zeroizing::new(pem_obj.contents().to_vec())),
        other => Err(ProtocolError::Crypto(format!(
            "unsupported key PEM '{other}', expected PKCS#8"
        ))),
    }
}

fn first_str<'a, 'b: 'a>(mut it: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>) -> Option<String> {
    it.next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

/// Extract `{client_id, org_id}` from a DER certificate. Both fields must be
/// present and non-empty.
pub fn extract_claims(cert_der: &[u8]) -> Result<PeerClaims, ProtocolError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| ProtocolError::Certificate(format!("failed to parse peer cert: {e}")))?;
    let subject = cert.subject();
    let client_id = first_str(subject.iter_common_name())
        .filter(|cn| !cn.is_empty())
        .ok_or_else(|| ProtocolError::Certificate("peer cert has no common name".into()))?;
    let org_id = first_str(subject.iter_organization())
        .filter(|o| !o.is_empty())
        .ok_or_else(|| ProtocolError::Certificate("peer cert has no organization".into()))?;
    Ok(PeerClaims { client_id, org_id })
}

/// Raw subject public key bytes of a DER certificate.
pub fn certificate_public_key(cert_der: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| ProtocolError::Certificate(format!("failed to parse certificate: {e}")))?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

fn parse_csr(csr_der: &[u8]) -> Result<X509CertificationRequest<'_>, ProtocolError> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| ProtocolError::Certificate(format!("failed to parse CSR: {e}")))?;
    Ok(csr)
}

/// Common name of a PEM CSR whose self-signature checks out.
pub fn csr_common_name(csr_pem: &str) -> Result<String, ProtocolError> {
    let der = parse_pem(csr_pem)?;
    let csr = parse_csr(&der)?;
    csr.verify_signature()
        .map_err(|e| ProtocolError::Certificate(format!("CSR signature invalid: {e}")))?;
    first_str(csr.certification_request_info.subject.iter_common_name())
        .ok_or_else(|| ProtocolError::Certificate("CSR has no common name".into()))
}

/// Check an approval before trusting it: the node certificate must carry the
/// public key of the original CSR and must be signed by the returned CA.
pub fn verify_issued(
    csr_pem: &str,
    node_cert_pem: &str,
    ca_cert_pem: &str,
) -> Result<(), ProtocolError> {
    let csr_der = parse_pem(csr_pem)?;
    let csr = parse_csr(&csr_der)?;

    let node_der = parse_pem(node_cert_pem)?;
    let (_, node_cert) = X509Certificate::from_der(&node_der)
        .map_err(|e| ProtocolError::Certificate(format!("failed to parse node cert: {e}")))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| ProtocolError::Certificate(format!("failed to parse CA cert: {e}")))?;

    let requested = &csr.certification_request_info.subject_pki.subject_public_key.data;
    let issued = &node_cert.public_key().subject_public_key.data;
    if requested != issued {
        return Err(ProtocolError::Certificate(
            "issued certificate does not match the CSR public key".into(),
        ));
    }

    node_cert
        .verify_signature(Some(ca_cert.public_key()))
        .map_err(|_| ProtocolError::Certificate("node certificate not signed by CA".into()))
}

/// A node's locally generated key pair and CSR. The private key never leaves
/// the node.
pub struct NodeCertRequest {
    key_pem: Zeroizing<String>,
    csr_pem: String,
}

impl NodeCertRequest {
    /// Generate a key pair and a CSR with CN = `node_name`, O = `organization`.
    pub fn new(node_name: &str, organization: &str) -> Result<Self, ProtocolError> {
        let key_pair = KeyPair::generate()
            .map_err(|e| ProtocolError::Crypto(format!("failed to generate node key: {e}")))?;
        Self::with_key(node_name, organization, key_pair)
    }

    /// Build a CSR for an existing PKCS#8 key, so a retried registration
    /// keeps the key that the pending request was filed with.
    pub fn from_key_pem(
        node_name: &str,
        organization: &str,
        key_pem: &str,
    ) -> Result<Self, ProtocolError> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| ProtocolError::Crypto(format!("failed to load node key: {e}")))?;
        Self::with_key(node_name, organization, key_pair)
    }

    fn with_key(node_name: &str, organization: &str, key_pair: KeyPair) -> Result<Self, ProtocolError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(node_name.to_string()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(organization.to_string()),
        );
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| ProtocolError::Certificate(format!("failed to create CSR: {e}")))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| ProtocolError::Certificate(format!("failed to serialize CSR: {e}")))?;

        Ok(Self {
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
            csr_pem,
        })
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestAuthority;

    #[test]
    fn test_node_request_has_cn() {
        let req = NodeCertRequest::new("n1", "Alpha").unwrap();
        assert!(req.csr_pem().contains("BEGIN CERTIFICATE REQUEST"));
        assert!(req.private_key_pem().contains("BEGIN PRIVATE KEY"));
        assert_eq!(csr_common_name(req.csr_pem()).unwrap(), "n1");
    }

    #[test]
    fn test_request_from_existing_key_keeps_public_key() {
        let first = NodeCertRequest::new("n1", "Alpha").unwrap();
        let second = NodeCertRequest::from_key_pem("n1", "Alpha", first.private_key_pem()).unwrap();
        let ca = TestAuthority::new("Test CA");
        let cert = ca.sign_csr(first.csr_pem());
        assert!(verify_issued(second.csr_pem(), &cert, ca.cert_pem()).is_ok());
    }

    #[test]
    fn test_csr_common_name_rejects_garbage() {
        assert!(csr_common_name("not a csr").is_err());
        let cert_pem = TestAuthority::new("Test CA").cert_pem().to_string();
        assert!(csr_common_name(&cert_pem).is_err());
    }

    #[test]
    fn test_extract_claims_from_client_cert() {
        let ca = TestAuthority::new("Test CA");
        let (cert_pem, _key) = ca.issue_client("n1", "Alpha");
        let claims = extract_claims(&parse_pem(&cert_pem).unwrap()).unwrap();
        assert_eq!(claims.client_id, "n1");
        assert_eq!(claims.org_id, "Alpha");
    }

    #[test]
    fn test_extract_claims_requires_org() {
        let ca = TestAuthority::new("Test CA");
        let der = parse_pem(ca.cert_pem()).unwrap();
        assert!(extract_claims(&der).is_err());
    }

    #[test]
    fn test_verify_issued_accepts_matching_bundle() {
        let ca = TestAuthority::new("Test CA");
        let req = NodeCertRequest::new("n1", "Alpha").unwrap();
        let cert = ca.sign_csr(req.csr_pem());
        assert!(verify_issued(req.csr_pem(), &cert, ca.cert_pem()).is_ok());
    }

    #[test]
    fn test_verify_issued_rejects_other_key() {
        let ca = TestAuthority::new("Test CA");
        let req = NodeCertRequest::new("n1", "Alpha").unwrap();
        let other = NodeCertRequest::new("n1", "Alpha").unwrap();
        let cert = ca.sign_csr(other.csr_pem());
        assert!(verify_issued(req.csr_pem(), &cert, ca.cert_pem()).is_err());
    }

    #[test]
    fn test_verify_issued_rejects_other_ca() {
        let ca = TestAuthority::new("Test CA");
        let rogue = TestAuthority::new("Rogue CA");
        let req = NodeCertRequest::new("n1", "Alpha").unwrap();
        let cert = rogue.sign_csr(req.csr_pem());
        assert!(verify_issued(req.csr_pem(), &cert, ca.cert_pem()).is_err());
    }

    #[test]
    fn test_decode_plain_private_key() {
        let req = NodeCertRequest::new("n1", "Alpha").unwrap();
        let der = decode_private_key(req.private_key_pem(), None).unwrap();
        assert!(!der.is_empty());
    }
}
