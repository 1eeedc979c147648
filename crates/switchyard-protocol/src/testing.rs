//! In-memory certificate authority for tests.

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_ED25519,
};

/// A throwaway CA that issues server and client certificates and signs CSRs.
pub struct TestAuthority {
    cert_pem: String,
    key_pem: String,
}

fn dn(cn: &str, org: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
    if let Some(org) = org {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    dn
}

impl TestAuthority {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().expect("CA key generation should succeed");
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).expect("CA self-signing should succeed");
        Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    fn issue(&self, params: CertificateParams, key: &KeyPair) -> String {
        let ca_key = KeyPair::from_pem(&self.key_pem).expect("CA key should load");
        let issuer =
            Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).expect("issuer should build");
        params
            .signed_by(key, &issuer)
            .expect("certificate signing should succeed")
            .pem()
    }

    /// Broker certificate with an Ed25519 key, usable both for TLS and for
    /// broadcast signing. Returns `(cert_pem, pkcs8_key_pem)`.
    pub fn issue_server(&self, cn: &str) -> (String, String) {
        let key = KeyPair::generate_for(&PKCS_ED25519).expect("Ed25519 key generation");
        let mut params =
            CertificateParams::new(vec!["localhost".to_string()]).expect("valid SAN");
        params.distinguished_name = dn(cn, Some("Switchyard"));
        (self.issue(params, &key), key.serialize_pem())
    }

    /// Node certificate with CN = `cn` and O = `org`.
    pub fn issue_client(&self, cn: &str, org: &str) -> (String, String) {
        let key = KeyPair::generate().expect("client key generation");
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(cn, Some(org));
        (self.issue(params, &key), key.serialize_pem())
    }

    /// Client certificate lacking an organization, so claim extraction fails.
    pub fn issue_client_without_org(&self, cn: &str) -> (String, String) {
        let key = KeyPair::generate().expect("client key generation");
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(cn, None);
        (self.issue(params, &key), key.serialize_pem())
    }

    /// Sign a PEM CSR, keeping its subject.
    pub fn sign_csr(&self, csr_pem: &str) -> String {
        let csr = CertificateSigningRequestParams::from_pem(csr_pem).expect("CSR should parse");
        let ca_key = KeyPair::from_pem(&self.key_pem).expect("CA key should load");
        let issuer =
            Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).expect("issuer should build");
        csr.signed_by(&issuer).expect("CSR signing should succeed").pem()
    }
}

/// Write `contents` to `dir/name` and return the path.
pub fn write_pem(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("fixture write should succeed");
    path
}
