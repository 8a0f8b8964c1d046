use crate::Result;
use rsip::{host_with_port, HostWithPort};
use std::{fmt, hash::Hash, net::SocketAddr};

/// A SIP network address: host/port plus the transport it is reached over.
///
/// Used for Via processing, connection keys in the transport layer and
/// request destinations. Convertible to/from `SocketAddr` (IP hosts only),
/// `rsip::Uri` and `rsip::HostWithPort`.
#[derive(Debug, Eq, PartialEq, Clone, Default)]
pub struct SipAddr {
    pub r#type: Option<rsip::transport::Transport>,
    pub addr: HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipAddr {
                r#type: Some(r#type),
                addr,
            } => write!(f, "{} {}", r#type, addr),
            SipAddr { r#type: None, addr } => write!(f, "{}", addr),
        }
    }
}

impl Hash for SipAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.r#type.hash(state);
        match self.addr.host {
            host_with_port::Host::Domain(ref domain) => domain.to_string().hash(state),
            host_with_port::Host::IpAddr(ref ip_addr) => ip_addr.hash(state),
        }
        if let Some(port) = self.addr.port {
            port.value().hash(state);
        }
    }
}

impl SipAddr {
    pub fn new(transport: rsip::transport::Transport, addr: HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        match &self.addr.host {
            host_with_port::Host::Domain(domain) => Err(crate::Error::Error(format!(
                "cannot convert domain {} to SocketAddr",
                domain
            ))),
            host_with_port::Host::IpAddr(ip_addr) => {
                let port = self.addr.port.map_or(5060, |p| p.value().to_owned());
                Ok(SocketAddr::new(ip_addr.to_owned(), port))
            }
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self.r#type, Some(rsip::transport::Transport::Tcp))
    }
}

impl From<&SipAddr> for rsip::Uri {
    fn from(addr: &SipAddr) -> Self {
        rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            host_with_port: addr.addr.clone(),
            ..Default::default()
        }
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        let host_with_port = HostWithPort {
            host: addr.ip().into(),
            port: Some(addr.port().into()),
        };
        SipAddr {
            r#type: None,
            addr: host_with_port,
        }
    }
}

impl From<rsip::host_with_port::HostWithPort> for SipAddr {
    fn from(host_with_port: rsip::host_with_port::HostWithPort) -> Self {
        SipAddr {
            r#type: None,
            addr: host_with_port,
        }
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = crate::Error;

    fn try_from(uri: &rsip::Uri) -> Result<Self> {
        let transport = uri.transport().cloned();
        Ok(SipAddr {
            r#type: transport,
            addr: uri.host_with_port.clone(),
        })
    }
}
