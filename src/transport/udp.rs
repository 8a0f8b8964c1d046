use super::{
    connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    SipAddr, SipConnection, TransportEvent,
};
use crate::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

struct UdpInner {
    conn: UdpSocket,
    addr: SipAddr,
}

#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
    cancel_token: Option<CancellationToken>,
}

impl UdpConnection {
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let exposed = external.unwrap_or(SipConnection::resolve_bind_address(conn.local_addr()?));
        let t = UdpConnection {
            inner: Arc::new(UdpInner {
                addr: SipAddr {
                    r#type: Some(rsip::transport::Transport::Udp),
                    addr: exposed.into(),
                },
                conn,
            }),
            cancel_token,
        };
        info!("created UDP connection: {}", t.get_addr());
        Ok(t)
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.cancel_token.clone()
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    error!("error receiving UDP packet: {}", e);
                    continue;
                }
            };

            if buf[..len] == *KEEPALIVE_REQUEST || buf[..len] == *KEEPALIVE_RESPONSE {
                self.inner
                    .conn
                    .send_to(KEEPALIVE_RESPONSE, addr)
                    .await
                    .ok();
                continue;
            }

            let undecoded = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(e) => {
                    info!("not UTF-8 from {}: {} {:?}", addr, e, &buf[..len.min(64)]);
                    continue;
                }
            };

            let msg = match rsip::SipMessage::try_from(undecoded) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("dropping malformed message from {}: {} {}", addr, e, undecoded);
                    continue;
                }
            };

            let msg = match SipConnection::update_msg_received(
                msg,
                addr,
                rsip::transport::Transport::Udp,
            ) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("error updating Via received from {}: {}", addr, e);
                    continue;
                }
            };

            trace!("received {} bytes {} -> {}", len, addr, self.get_addr());

            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                SipAddr {
                    r#type: Some(rsip::transport::Transport::Udp),
                    addr: addr.into(),
                },
            ))?;
        }
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let target = match destination {
            Some(addr) => addr.get_socketaddr()?,
            None => SipConnection::get_destination(&msg)?,
        };
        let buf = msg.to_string();

        trace!(
            "sending {} bytes {} -> {}",
            buf.len(),
            self.get_addr(),
            target
        );

        self.inner
            .conn
            .send_to(buf.as_bytes(), target)
            .await
            .map_err(|e| {
                crate::Error::TransportLayer(e.to_string(), self.get_addr().to_owned())
            })
            .map(|_| ())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_addr().addr)
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_addr().addr)
    }
}
