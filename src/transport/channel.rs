use super::{
    connection::{TransportReceiver, TransportSender},
    SipAddr, SipConnection,
};
use crate::Result;
use std::sync::{Arc, Mutex};

struct ChannelInner {
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
    addr: SipAddr,
}

/// In-memory loopback connection. Messages sent here surface on the paired
/// receiver as if they had arrived from the network; tests use a pair of
/// these to stand in for a camera.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
    ) -> Result<Self> {
        Ok(ChannelConnection {
            inner: Arc::new(ChannelInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
            }),
        })
    }

    pub async fn send(&self, msg: rsip::SipMessage) -> Result<()> {
        let transport = SipConnection::Channel(self.clone());
        let source = self.get_addr().clone();
        self.inner
            .outgoing
            .send(super::TransportEvent::Incoming(msg, transport, source))
            .map_err(|e| e.into())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let Some(mut incoming) = incoming else {
            return Err(crate::Error::Error(
                "ChannelConnection::serve_loop called twice".to_string(),
            ));
        };
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHANNEL {}", self.inner.addr)
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHANNEL {}", self.inner.addr)
    }
}
