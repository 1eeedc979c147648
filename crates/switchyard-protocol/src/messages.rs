use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{ADMIN_TOPIC, CERT_SEPARATOR, HEARTBEAT_TARGET};
use crate::framing::decode_message;
use crate::identity::PeerIdentity;
use crate::pki::PeerClaims;
use crate::ProtocolError;

/// Short tag naming the purpose of a control-plane message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlWord {
    Ident,
    Reload,
    Finished,
    Register,
}

impl ControlWord {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ident => "IDENT",
            Self::Reload => "RELOAD",
            Self::Finished => "FINISHED",
            Self::Register => "REGISTER",
        }
    }
}

impl FromStr for ControlWord {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDENT" => Ok(Self::Ident),
            "RELOAD" => Ok(Self::Reload),
            "FINISHED" => Ok(Self::Finished),
            "REGISTER" => Ok(Self::Register),
            other => Err(ProtocolError::Malformed(format!("unknown control word '{other}'"))),
        }
    }
}

impl fmt::Display for ControlWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Router-side request/reply shapes ──

/// A decrypted application message from a peer, tagged with routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub ident: PeerIdentity,
    /// Verified certificate claims; `None` for anonymous peers.
    pub claims: Option<PeerClaims>,
    pub target: String,
    pub command: String,
    pub args: Vec<String>,
}

impl ClientRequest {
    /// The full application parts: target, command, args.
    pub fn parts(&self) -> Vec<String> {
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        parts.push(self.target.clone());
        parts.push(self.command.clone());
        parts.extend(self.args.iter().cloned());
        parts
    }

    pub fn is_admin(&self) -> bool {
        self.target == ADMIN_TOPIC
    }

    /// Frames forwarded to an out-of-process worker:
    /// `[peer_identity, client_id, org_id, json(parts)]`.
    pub fn to_worker_frames(&self) -> Vec<Vec<u8>> {
        let (client_id, org_id) = self
            .claims
            .as_ref()
            .map(|c| (c.client_id.clone(), c.org_id.clone()))
            .unwrap_or_default();
        let body = serde_json::to_vec(&self.parts()).unwrap_or_default();
        vec![
            self.ident.as_bytes().to_vec(),
            client_id.into_bytes(),
            org_id.into_bytes(),
            body,
        ]
    }
}

/// A reply produced by a worker, addressed to the peer that asked.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReply {
    pub ident: PeerIdentity,
    pub parts: Vec<String>,
}

/// Outcome of parsing anything the router receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(ClientRequest),
    Reply(WorkerReply),
    Malformed(String),
}

/// Parse one decrypted message from a peer. Never fails: bad input yields
/// `Inbound::Malformed` with the reason.
pub fn parse_request(ident: PeerIdentity, claims: Option<PeerClaims>, message: &[u8]) -> Inbound {
    let parts = match decode_message(message) {
        Ok(parts) => parts,
        Err(e) => return Inbound::Malformed(e.to_string()),
    };
    let mut parts = parts.into_iter();
    let (Some(target), Some(command)) = (parts.next(), parts.next()) else {
        return Inbound::Malformed("request needs a target and a command".into());
    };
    if target.is_empty() {
        return Inbound::Malformed("empty request target".into());
    }
    Inbound::Request(ClientRequest {
        ident,
        claims,
        target,
        command,
        args: parts.collect(),
    })
}

/// Parse worker reply frames `[peer_identity, json(parts)]`.
pub fn parse_reply<F: AsRef<[u8]>>(frames: &[F]) -> Inbound {
    let [ident, body] = frames else {
        return Inbound::Malformed(format!("reply needs 2 frames, got {}", frames.len()));
    };
    let ident = match PeerIdentity::new(ident.as_ref()) {
        Ok(ident) => ident,
        Err(e) => return Inbound::Malformed(e.to_string()),
    };
    match decode_message(body.as_ref()) {
        Ok(parts) if !parts.is_empty() => Inbound::Reply(WorkerReply { ident, parts }),
        Ok(_) => Inbound::Malformed("empty reply".into()),
        Err(e) => Inbound::Malformed(e.to_string()),
    }
}

// ── Heartbeat ──

/// Liveness signal from a node. Identity, name and organization come from
/// the socket and the verified certificate, never from the message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub ident: PeerIdentity,
    pub peer: String,
    pub org: String,
    pub control: ControlWord,
}

impl HeartbeatRequest {
    pub fn from_request(req: &ClientRequest) -> Result<Self, ProtocolError> {
        if req.target != HEARTBEAT_TARGET {
            return Err(ProtocolError::Malformed(format!("not a heartbeat: '{}'", req.target)));
        }
        let claims = req
            .claims
            .as_ref()
            .ok_or_else(|| ProtocolError::Malformed("heartbeat from unauthenticated peer".into()))?;
        let control: ControlWord = req.command.parse()?;
        if control == ControlWord::Register {
            return Err(ProtocolError::Malformed("REGISTER is not a heartbeat control".into()));
        }
        Ok(Self {
            ident: req.ident.clone(),
            peer: claims.client_id.clone(),
            org: claims.org_id.clone(),
            control,
        })
    }

    /// Wire parts a node sends for this control word.
    pub fn parts(control: ControlWord) -> Vec<String> {
        vec![HEARTBEAT_TARGET.to_string(), control.as_str().to_string()]
    }
}

// ── Registration sub-protocol ──

/// `[ADMIN_TOPIC, "REGISTER", node_name, csr_pem]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub node: String,
    pub csr_pem: String,
}

impl RegisterRequest {
    pub fn parts(&self) -> Vec<String> {
        vec![
            ADMIN_TOPIC.to_string(),
            ControlWord::Register.as_str().to_string(),
            self.node.clone(),
            self.csr_pem.clone(),
        ]
    }

    pub fn from_request(req: &ClientRequest) -> Result<Self, ProtocolError> {
        if !req.is_admin() || req.command != ControlWord::Register.as_str() {
            return Err(ProtocolError::Malformed(format!(
                "unsupported admin command '{}'",
                req.command
            )));
        }
        let node = req.args.first().cloned().unwrap_or_default();
        let csr_pem = req.args.get(1).cloned().unwrap_or_default();
        Ok(Self { node, csr_pem })
    }
}

/// Terminal registration outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionCode {
    CertExists,
    CnMismatch,
    InvalidCsr,
    ForbiddenName,
    ApprovalFailed,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CertExists => "ERR_CRT_EXISTS",
            Self::CnMismatch => "ERR_CN_FAIL",
            Self::InvalidCsr => "INV_CSR",
            Self::ForbiddenName => "ERR_NAME_FORBD",
            Self::ApprovalFailed => "APPR_FAIL",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "ERR_CRT_EXISTS" => Some(Self::CertExists),
            "ERR_CN_FAIL" => Some(Self::CnMismatch),
            "INV_CSR" => Some(Self::InvalidCsr),
            "ERR_NAME_FORBD" => Some(Self::ForbiddenName),
            "APPR_FAIL" => Some(Self::ApprovalFailed),
            _ => None,
        }
    }

    /// Default operator-facing explanation.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::CertExists => "a certificate for this node name already exists",
            Self::CnMismatch => "the CSR common name does not match the node name",
            Self::InvalidCsr => "the CSR could not be parsed",
            Self::ForbiddenName => "the node name is not allowed",
            Self::ApprovalFailed => "the master failed to approve the request",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three PEM blocks returned with an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertBundle {
    pub node_cert: String,
    pub ca_cert: String,
    pub server_cert: String,
}

impl CertBundle {
    pub fn to_payload(&self) -> String {
        [
            self.node_cert.as_str(),
            self.ca_cert.as_str(),
            self.server_cert.as_str(),
        ]
        .join(CERT_SEPARATOR)
    }

    /// Split on the exact separator token; exactly three non-empty blocks.
    pub fn from_payload(payload: &str) -> Result<Self, ProtocolError> {
        let blocks: Vec<&str> = payload.split(CERT_SEPARATOR).collect();
        let [node, ca, server] = blocks.as_slice() else {
            return Err(ProtocolError::Malformed(format!(
                "approval payload has {} blocks, expected 3",
                blocks.len()
            )));
        };
        if node.trim().is_empty() || ca.trim().is_empty() || server.trim().is_empty() {
            return Err(ProtocolError::Malformed("approval payload has an empty block".into()));
        }
        Ok(Self {
            node_cert: node.to_string(),
            ca_cert: ca.to_string(),
            server_cert: server.to_string(),
        })
    }
}

/// Master's answer to a REGISTER request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationReply {
    SendCsr,
    Pending,
    Approved(CertBundle),
    Rejected {
        code: RejectionCode,
        reason: Option<String>,
    },
}

impl RegistrationReply {
    pub fn rejected(code: RejectionCode) -> Self {
        Self::Rejected { code, reason: None }
    }

    /// Transient replies are retried by the node.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SendCsr | Self::Pending)
    }

    pub fn to_parts(&self) -> Vec<String> {
        match self {
            Self::SendCsr => vec!["SEND_CSR".into()],
            Self::Pending => vec!["PENDING".into()],
            Self::Approved(bundle) => vec!["APPROVED".into(), bundle.to_payload()],
            Self::Rejected { code, reason } => {
                let mut parts = vec![code.as_str().to_string()];
                if let Some(reason) = reason {
                    parts.push(reason.clone());
                }
                parts
            }
        }
    }

    pub fn from_parts(parts: &[String]) -> Result<Self, ProtocolError> {
        let code = parts
            .first()
            .ok_or_else(|| ProtocolError::Malformed("empty registration reply".into()))?;
        match code.as_str() {
            "SEND_CSR" => Ok(Self::SendCsr),
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => {
                let payload = parts
                    .get(1)
                    .ok_or_else(|| ProtocolError::Malformed("APPROVED without certificates".into()))?;
                Ok(Self::Approved(CertBundle::from_payload(payload)?))
            }
            other => RejectionCode::from_code(other)
                .map(|code| Self::Rejected {
                    code,
                    reason: parts.get(1).cloned(),
                })
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!("unknown registration reply '{other}'"))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_message;

    fn ident() -> PeerIdentity {
        PeerIdentity::new(b"node-1".to_vec()).unwrap()
    }

    fn claims() -> Option<PeerClaims> {
        Some(PeerClaims {
            client_id: "n1".into(),
            org_id: "Alpha".into(),
        })
    }

    #[test]
    fn test_parse_request_valid() {
        let msg = encode_message(&["jobs", "run", "a", "b"]);
        match parse_request(ident(), claims(), &msg) {
            Inbound::Request(req) => {
                assert_eq!(req.target, "jobs");
                assert_eq!(req.command, "run");
                assert_eq!(req.args, vec!["a", "b"]);
                assert_eq!(req.parts(), vec!["jobs", "run", "a", "b"]);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_request_malformed() {
        assert!(matches!(parse_request(ident(), None, b"not json"), Inbound::Malformed(_)));
        let short = encode_message(&["only-target"]);
        assert!(matches!(parse_request(ident(), None, &short), Inbound::Malformed(_)));
        let empty_target = encode_message(&["", "cmd"]);
        assert!(matches!(parse_request(ident(), None, &empty_target), Inbound::Malformed(_)));
    }

    #[test]
    fn test_parse_reply_shapes() {
        let body = serde_json::to_vec(&["TOPIC", "abc"]).unwrap();
        match parse_reply(&[b"node-1".to_vec(), body]) {
            Inbound::Reply(r) => {
                assert_eq!(r.ident, ident());
                assert_eq!(r.parts, vec!["TOPIC", "abc"]);
            }
            other => panic!("expected reply, got {other:?}"),
        }
        assert!(matches!(parse_reply(&[b"node-1".to_vec()]), Inbound::Malformed(_)));
        assert!(matches!(parse_reply(&[Vec::new(), b"[\"x\"]".to_vec()]), Inbound::Malformed(_)));
        assert!(matches!(parse_reply(&[b"n".to_vec(), b"[]".to_vec()]), Inbound::Malformed(_)));
    }

    #[test]
    fn test_worker_frames_carry_claims() {
        let msg = encode_message(&["jobs", "run"]);
        let Inbound::Request(req) = parse_request(ident(), claims(), &msg) else {
            panic!("expected request");
        };
        let frames = req.to_worker_frames();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1], b"n1");
        assert_eq!(frames[2], b"Alpha");
    }

    #[test]
    fn test_heartbeat_requires_claims() {
        let msg = encode_message(&HeartbeatRequest::parts(ControlWord::Ident));
        let Inbound::Request(anon) = parse_request(ident(), None, &msg) else {
            panic!("expected request");
        };
        assert!(HeartbeatRequest::from_request(&anon).is_err());

        let Inbound::Request(req) = parse_request(ident(), claims(), &msg) else {
            panic!("expected request");
        };
        let hb = HeartbeatRequest::from_request(&req).unwrap();
        assert_eq!(hb.peer, "n1");
        assert_eq!(hb.org, "Alpha");
        assert_eq!(hb.control, ControlWord::Ident);
    }

    #[test]
    fn test_registration_reply_codes() {
        for reply in [
            RegistrationReply::SendCsr,
            RegistrationReply::Pending,
            RegistrationReply::rejected(RejectionCode::CnMismatch),
            RegistrationReply::Rejected {
                code: RejectionCode::ForbiddenName,
                reason: Some("reserved".into()),
            },
        ] {
            assert_eq!(RegistrationReply::from_parts(&reply.to_parts()).unwrap(), reply);
        }
        assert!(RegistrationReply::from_parts(&["REJECTED".to_string()]).is_err());
        assert!(RegistrationReply::from_parts(&[]).is_err());
        assert!(RegistrationReply::Pending.is_transient());
        assert!(!RegistrationReply::rejected(RejectionCode::InvalidCsr).is_transient());
    }

    #[test]
    fn test_cert_bundle_splits_on_exact_token() {
        let bundle = CertBundle {
            node_cert: "NODE".into(),
            ca_cert: "CA".into(),
            server_cert: "SERVER".into(),
        };
        let payload = bundle.to_payload();
        assert_eq!(CertBundle::from_payload(&payload).unwrap(), bundle);
        assert!(CertBundle::from_payload("NODE----CA").is_err());
        let four = format!("{payload}{CERT_SEPARATOR}EXTRA");
        assert!(CertBundle::from_payload(&four).is_err());
    }
}
