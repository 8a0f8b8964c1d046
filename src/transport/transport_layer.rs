use super::{connection::TransportSender, SipAddr, SipConnection, TcpConnection, TransportEvent};
use crate::Result;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
pub struct TransportLayerInner {
    cancel_token: CancellationToken,
    // listen sockets, keyed by their exposed address
    listens: Arc<Mutex<HashMap<SipAddr, SipConnection>>>,
    // established per-peer connections (inbound TCP accepts, dial-outs)
    connections: Arc<Mutex<HashMap<SipAddr, SipConnection>>>,
    sender: Mutex<Option<TransportSender>>,
}

/// Owns every socket the gateway speaks SIP over and picks the connection
/// for an outbound message: an established per-peer connection when one
/// exists (required for TCP devices), the UDP listen socket otherwise.
#[derive(Default)]
pub struct TransportLayer {
    pub outbound: Option<SipAddr>,
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        let inner = TransportLayerInner {
            cancel_token,
            listens: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
            sender: Mutex::new(None),
        };
        Self {
            outbound: None,
            inner: Arc::new(inner),
        }
    }

    pub fn add_transport(&self, connection: SipConnection) {
        self.inner
            .listens
            .lock()
            .unwrap()
            .insert(connection.get_addr().to_owned(), connection);
    }

    pub fn del_transport(&self, addr: &SipAddr) {
        self.inner.listens.lock().unwrap().remove(addr);
    }

    pub fn add_connection(&self, connection: SipConnection) {
        self.inner
            .connections
            .lock()
            .unwrap()
            .insert(connection.get_addr().to_owned(), connection);
    }

    pub fn del_connection(&self, addr: &SipAddr) {
        self.inner.connections.lock().unwrap().remove(addr);
    }

    pub async fn lookup(&self, target: &SipAddr) -> Result<SipConnection> {
        self.inner.lookup(target, self.outbound.as_ref()).await
    }

    pub async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        self.inner.sender.lock().unwrap().replace(sender.clone());
        self.inner.serve_listens(sender).await
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.listens.lock().unwrap().keys().cloned().collect()
    }
}

impl TransportLayerInner {
    async fn lookup(&self, target: &SipAddr, outbound: Option<&SipAddr>) -> Result<SipConnection> {
        let target = outbound.unwrap_or(target);
        debug!("lookup target: {}", target);

        if let Some(connection) = self.connections.lock().unwrap().get(target) {
            return Ok(connection.clone());
        }
        if let Some(connection) = self.listens.lock().unwrap().get(target) {
            return Ok(connection.clone());
        }

        match target.r#type {
            None | Some(rsip::transport::Transport::Udp) => {
                let listens = self.listens.lock().unwrap();
                for connection in listens.values() {
                    if matches!(connection, SipConnection::Udp(_) | SipConnection::Channel(_)) {
                        return Ok(connection.clone());
                    }
                }
            }
            Some(rsip::transport::Transport::Tcp) => {
                // no connection to this peer yet, dial one
                let connection: SipConnection =
                    TcpConnection::connect(target, Some(self.cancel_token.child_token()))
                        .await?
                        .into();
                self.connections
                    .lock()
                    .unwrap()
                    .insert(target.to_owned(), connection.clone());

                let sender = self.sender.lock().unwrap().clone();
                if let Some(sender) = sender {
                    let serve_conn = connection.clone();
                    let connections = self.connections.clone();
                    let peer = target.to_owned();
                    tokio::spawn(async move {
                        serve_conn.serve_loop(sender.clone()).await.ok();
                        connections.lock().unwrap().remove(&peer);
                        sender.send(TransportEvent::Closed(serve_conn)).ok();
                    });
                }
                return Ok(connection);
            }
            _ => {}
        }

        Err(crate::Error::TransportLayer(
            "no transport for target".to_string(),
            target.to_owned(),
        ))
    }

    async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        let listens = self.listens.lock().unwrap().clone();
        for (_, transport) in listens {
            let sub_token = self.cancel_token.child_token();
            let sender_clone = sender.clone();
            let listens_ref = self.listens.clone();

            tokio::spawn(async move {
                select! {
                    _ = sub_token.cancelled() => { }
                    _ = transport.serve_loop(sender_clone.clone()) => { }
                }
                listens_ref.lock().unwrap().remove(transport.get_addr());
                warn!("transport serve loop exited: {}", transport.get_addr());
                sender_clone.send(TransportEvent::Closed(transport)).ok();
            });
        }
        info!("transport layer serving {} listens", self.listens.lock().unwrap().len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        transport::{udp::UdpConnection, SipAddr},
        Result,
    };

    #[tokio::test]
    async fn test_lookup() -> Result<()> {
        let tl = super::TransportLayer::new(tokio_util::sync::CancellationToken::new());

        let target = SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: rsip::HostWithPort::try_from("127.0.0.1:5060")?,
        };
        assert!(tl.lookup(&target).await.is_err());

        let udp_peer =
            UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
        let udp_peer_addr = udp_peer.get_addr().to_owned();
        tl.add_transport(udp_peer.into());

        // any UDP target resolves to the UDP listen socket
        let connection = tl.lookup(&target).await?;
        assert_eq!(connection.get_addr(), &udp_peer_addr);

        // outbound overrides the target
        let mut tl = tl;
        tl.outbound = Some(udp_peer_addr.clone());
        let connection = tl.lookup(&target).await?;
        assert_eq!(connection.get_addr(), &udp_peer_addr);
        Ok(())
    }
}
