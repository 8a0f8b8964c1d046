use super::{
    channel::ChannelConnection, sip_addr::SipAddr, tcp::TcpConnection,
    tcp_listener::TcpListenerConnection, udp::UdpConnection,
};
use crate::Result;
use get_if_addrs::IfAddr;
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Param, SipMessage,
};
use std::net::{IpAddr, Ipv4Addr};
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Transport layer events delivered to the endpoint.
///
/// * `Incoming` - a SIP message was received, with the connection it came
///   in on and the peer address
/// * `New` - a connection was established (inbound TCP accept or dial-out)
/// * `Closed` - a connection went away
#[derive(Debug)]
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// A single transport a SIP message can be sent over.
///
/// GB28181 devices speak UDP or TCP; `Channel` is the in-memory loopback
/// the tests drive simulated devices through. Responses to requests that
/// arrived over TCP are written back to the same connection, which is why
/// the connection travels alongside every incoming message.
#[derive(Clone, Debug)]
pub enum SipConnection {
    Channel(ChannelConnection),
    Udp(UdpConnection),
    Tcp(TcpConnection),
    TcpListener(TcpListenerConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, SipConnection::Udp(_) | SipConnection::Channel(_))
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        match self {
            SipConnection::Udp(transport) => transport.cancel_token(),
            SipConnection::Tcp(transport) => transport.cancel_token(),
            _ => None,
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Channel(transport) => transport.get_addr(),
            SipConnection::Udp(transport) => transport.get_addr(),
            SipConnection::Tcp(transport) => transport.get_addr(),
            SipConnection::TcpListener(transport) => transport.get_addr(),
        }
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Channel(transport) => transport.send(msg).await,
            SipConnection::Udp(transport) => transport.send(msg, destination).await,
            SipConnection::Tcp(transport) => transport.send_message(msg).await,
            SipConnection::TcpListener(transport) => {
                debug!("listener connection cannot send: {}", transport.get_addr());
                Ok(())
            }
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Channel(transport) => transport.serve_loop(sender).await,
            SipConnection::Udp(transport) => transport.serve_loop(sender).await,
            SipConnection::Tcp(transport) => transport.serve_loop(sender).await,
            SipConnection::TcpListener(transport) => transport.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.close().await,
            SipConnection::TcpListener(transport) => transport.close().await,
            // UDP and channel connections carry no per-peer state
            _ => Ok(()),
        }
    }
}

impl SipConnection {
    /// Patch `received`/`rport` into the top Via of an incoming request when
    /// the source address differs from what the peer wrote there (RFC 3261
    /// §18.2.1). Responses pass through untouched.
    pub fn update_msg_received(
        msg: SipMessage,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                let via = req.via_header_mut()?;
                Self::build_via_received(via, addr, transport)?;
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    pub fn build_via_received(
        via: &mut rsip::headers::Via,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<()> {
        let received: rsip::HostWithPort = addr.into();
        let mut typed_via = via.typed()?;

        if typed_via.uri.host_with_port == received {
            return Ok(());
        }

        typed_via.params.retain(|param| match param {
            Param::Received(_) => false,
            Param::Other(key, _) => !key.value().eq_ignore_ascii_case("rport"),
            _ => true,
        });

        *via = typed_via
            .with_param(Param::Received(rsip::param::Received::new(
                received.host.to_string(),
            )))
            .with_param(Param::Other(
                rsip::param::OtherParam::new("rport"),
                Some(rsip::param::OtherParamValue::new(addr.port().to_string())),
            ))
            .into();
        let _ = transport;
        Ok(())
    }

    /// Where a response should be sent: top Via `received`/`rport` when
    /// present, the Via sent-by otherwise.
    pub fn parse_target_from_via(
        via: &rsip::headers::untyped::Via,
    ) -> Result<(rsip::Transport, rsip::HostWithPort)> {
        let mut host_with_port = via.uri()?.host_with_port;
        let mut transport = via.trasnport().unwrap_or(rsip::Transport::Udp);
        if let Ok(params) = via.params().as_ref() {
            for param in params {
                match param {
                    Param::Received(v) => {
                        if let Ok(addr) = v.value().parse::<IpAddr>() {
                            host_with_port.host = addr.into();
                        }
                    }
                    Param::Transport(t) => {
                        transport = t.clone();
                    }
                    Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                        if let Ok(port) = value.value().parse::<u16>() {
                            host_with_port.port = Some(port.into());
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok((transport, host_with_port))
    }

    pub fn get_destination(msg: &rsip::SipMessage) -> Result<SocketAddr> {
        let host_with_port = match msg {
            rsip::SipMessage::Request(req) => req.uri().host_with_port.clone(),
            rsip::SipMessage::Response(res) => Self::parse_target_from_via(res.via_header()?)?.1,
        };
        host_with_port
            .try_into()
            .map_err(|e: rsip::Error| e.into())
    }

    /// Replace an unspecified bind address (0.0.0.0) with the first
    /// non-loopback interface address, so Via/Contact headers carry a
    /// reachable host.
    pub fn resolve_bind_address(addr: SocketAddr) -> SocketAddr {
        let ip = addr.ip();
        if !ip.is_unspecified() {
            return addr;
        }
        let interfaces = match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(_) => return addr,
        };
        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(v4addr) = interface.addr {
                return SocketAddr::new(IpAddr::V4(v4addr.ip), addr.port());
            }
        }
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), addr.port())
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Channel(t) => write!(f, "{}", t),
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "TCP {}", t),
            SipConnection::TcpListener(t) => write!(f, "TCP LISTEN {}", t),
        }
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<TcpListenerConnection> for SipConnection {
    fn from(connection: TcpListenerConnection) -> Self {
        SipConnection::TcpListener(connection)
    }
}
