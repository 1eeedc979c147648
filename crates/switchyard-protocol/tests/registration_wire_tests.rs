use switchyard_protocol::pki::{csr_common_name, verify_issued, NodeCertRequest};
use switchyard_protocol::testing::TestAuthority;
use switchyard_protocol::{
    encode_message, parse_request, CertBundle, ControlWord, Inbound, PeerIdentity,
    RegisterRequest, RegistrationReply, ADMIN_TOPIC,
};

#[test]
fn test_register_request_survives_framing() {
    let req = NodeCertRequest::new("n1", "Alpha").unwrap();
    let register = RegisterRequest {
        node: "n1".into(),
        csr_pem: req.csr_pem().to_string(),
    };
    let wire = encode_message(&register.parts());
    let ident = PeerIdentity::generate();
    let Inbound::Request(parsed) = parse_request(ident, None, &wire) else {
        panic!("register request should parse");
    };
    assert_eq!(parsed.target, ADMIN_TOPIC);
    assert_eq!(parsed.command, ControlWord::Register.as_str());
    let decoded = RegisterRequest::from_request(&parsed).unwrap();
    assert_eq!(decoded, register);
    assert_eq!(csr_common_name(&decoded.csr_pem).unwrap(), "n1");
}

#[test]
fn test_approval_bundle_verifies_on_node() {
    let ca = TestAuthority::new("Test CA");
    let (server_cert, _) = ca.issue_server("master");
    let req = NodeCertRequest::new("n1", "Alpha").unwrap();

    let reply = RegistrationReply::Approved(CertBundle {
        node_cert: ca.sign_csr(req.csr_pem()),
        ca_cert: ca.cert_pem().to_string(),
        server_cert,
    });
    let parts = reply.to_parts();
    let RegistrationReply::Approved(bundle) = RegistrationReply::from_parts(&parts).unwrap() else {
        panic!("expected approval");
    };
    verify_issued(req.csr_pem(), &bundle.node_cert, &bundle.ca_cert).unwrap();
}

#[test]
fn test_register_without_csr_has_empty_field() {
    let wire = encode_message(&[ADMIN_TOPIC, "REGISTER", "n1"]);
    let Inbound::Request(parsed) = parse_request(PeerIdentity::generate(), None, &wire) else {
        panic!("request should parse");
    };
    let decoded = RegisterRequest::from_request(&parsed).unwrap();
    assert!(decoded.csr_pem.is_empty());
}
