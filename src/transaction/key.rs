use crate::{Error, Result};
use rsip::{
    param::Tag,
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Method,
};
use std::hash::Hash;

/// Fallback key for peers that omit the RFC 3261 magic-cookie branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543 {
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
    pub via_host_port: HostWithPort,
}

impl Hash for Rfc2543 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
        self.via_host_port.to_string().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261 {
    pub branch: String,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
}

impl Hash for Rfc3261 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TransactionKey {
    RFC3261(Rfc3261),
    RFC2543(Rfc2543),
    Invalid,
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::RFC3261(k) => write!(
                f,
                "{} {}/{} {}({})",
                k.call_id, k.method, k.cseq, k.from_tag, k.branch,
            ),
            TransactionKey::RFC2543(k) => write!(
                f,
                "{} {}/{} {}[{}]",
                k.call_id, k.method, k.cseq, k.from_tag, k.via_host_port
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

impl TryFrom<&rsip::Request> for TransactionKey {
    type Error = crate::error::Error;

    fn try_from(req: &rsip::Request) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        match via.branch() {
            Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
                branch: branch.to_string(),
                method: req.method().clone(),
                cseq: req.cseq_header()?.seq()?,
                from_tag: req.from_header()?.tag()?.ok_or(Error::Transaction(
                    "from tag missing".to_string(),
                    TransactionKey::Invalid,
                ))?,
                call_id: req.call_id_header()?.to_string(),
            })),
            None => Ok(TransactionKey::RFC2543(Rfc2543 {
                method: req.method().clone(),
                cseq: req.cseq_header()?.seq()?,
                from_tag: req.from_header()?.tag()?.ok_or(Error::Transaction(
                    "from tag missing".to_string(),
                    TransactionKey::Invalid,
                ))?,
                call_id: req.call_id_header()?.to_string(),
                via_host_port: via.uri.host_with_port,
            })),
        }
    }
}

impl TryFrom<&rsip::Response> for TransactionKey {
    type Error = crate::error::Error;

    fn try_from(resp: &rsip::Response) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        match via.branch() {
            Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
                branch: branch.to_string(),
                method: cseq.method()?,
                cseq: cseq.seq()?,
                from_tag: resp.from_header()?.tag()?.ok_or(Error::Transaction(
                    "from tag missing".to_string(),
                    TransactionKey::Invalid,
                ))?,
                call_id: resp.call_id_header()?.to_string(),
            })),
            None => Ok(TransactionKey::RFC2543(Rfc2543 {
                method: cseq.method()?,
                cseq: cseq.seq()?,
                from_tag: resp.from_header()?.tag()?.ok_or(Error::Transaction(
                    "from tag missing".to_string(),
                    TransactionKey::Invalid,
                ))?,
                call_id: resp.call_id_header()?.to_string(),
                via_host_port: via.uri.host_with_port,
            })),
        }
    }
}
