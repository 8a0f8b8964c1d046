use super::{connection::TransportSender, SipAddr, SipConnection, TcpConnection, TransportEvent};
use crate::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct TcpListenerInner {
    local_addr: SipAddr,
    listener: Mutex<Option<TcpListener>>,
}

#[derive(Clone)]
pub struct TcpListenerConnection {
    inner: Arc<TcpListenerInner>,
    cancel_token: Option<CancellationToken>,
}

impl TcpListenerConnection {
    pub async fn create_listener(
        local: SocketAddr,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let exposed = SipConnection::resolve_bind_address(listener.local_addr()?);
        let local_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tcp),
            addr: exposed.into(),
        };
        info!("created TCP listener: {}", local_addr);
        Ok(TcpListenerConnection {
            inner: Arc::new(TcpListenerInner {
                local_addr,
                listener: Mutex::new(Some(listener)),
            }),
            cancel_token,
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    /// Accept loop. Each accepted stream becomes a `TcpConnection` announced
    /// with `TransportEvent::New` and served on its own task.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let listener = self.inner.listener.lock().await.take();
        let Some(listener) = listener else {
            return Err(crate::Error::Error(
                "TcpListenerConnection::serve_loop called twice".to_string(),
            ));
        };

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("TCP accept error: {}", e);
                    continue;
                }
            };

            let connection = match TcpConnection::from_stream(
                stream,
                self.inner.local_addr.clone(),
                self.cancel_token.as_ref().map(|t| t.child_token()),
            ) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("failed to wrap accepted stream from {}: {}", peer, e);
                    continue;
                }
            };

            let sip_connection = SipConnection::Tcp(connection.clone());
            sender.send(TransportEvent::New(sip_connection.clone()))?;

            let sender_clone = sender.clone();
            tokio::spawn(async move {
                connection.serve_loop(sender_clone.clone()).await.ok();
                sender_clone
                    .send(TransportEvent::Closed(sip_connection))
                    .ok();
            });
        }
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(token) = &self.cancel_token {
            token.cancel();
        }
        Ok(())
    }
}

impl std::fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.local_addr.addr)
    }
}

impl std::fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.local_addr.addr)
    }
}
