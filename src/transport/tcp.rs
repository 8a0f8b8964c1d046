use super::{
    connection::{TransportSender, KEEPALIVE_RESPONSE},
    stream::SipCodec,
    SipAddr, SipConnection, TransportEvent,
};
use crate::Result;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct TcpInner {
    local_addr: SipAddr,
    remote_addr: SipAddr,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<OwnedWriteHalf>,
}

/// A single TCP connection, inbound or dialed. The remote address is the
/// connection identity: responses and in-dialog requests to that peer reuse
/// this socket.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
    cancel_token: Option<CancellationToken>,
}

impl TcpConnection {
    pub async fn connect(
        remote: &SipAddr,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let socket_addr = remote.get_socketaddr()?;
        let stream = TcpStream::connect(socket_addr).await?;

        let local_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tcp),
            addr: SipConnection::resolve_bind_address(stream.local_addr()?).into(),
        };

        let connection = Self::from_halves(stream, local_addr, remote.clone(), cancel_token);
        info!(
            "created TCP client connection: {} -> {}",
            connection.inner.local_addr, remote
        );
        Ok(connection)
    }

    pub fn from_stream(
        stream: TcpStream,
        local_addr: SipAddr,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let remote_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tcp),
            addr: stream.peer_addr()?.into(),
        };
        let connection = Self::from_halves(stream, local_addr, remote_addr, cancel_token);
        info!(
            "created TCP server connection: {} <- {}",
            connection.inner.local_addr, connection.inner.remote_addr
        );
        Ok(connection)
    }

    fn from_halves(
        stream: TcpStream,
        local_addr: SipAddr,
        remote_addr: SipAddr,
        cancel_token: Option<CancellationToken>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        TcpConnection {
            inner: Arc::new(TcpInner {
                local_addr,
                remote_addr,
                read_half: Mutex::new(Some(read_half)),
                write_half: Mutex::new(write_half),
            }),
            cancel_token,
        }
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.cancel_token.clone()
    }

    /// The peer address; this is the key the transport layer files the
    /// connection under.
    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub async fn send_message(&self, msg: rsip::SipMessage) -> Result<()> {
        let data = msg.to_string();
        let mut lock = self.inner.write_half.lock().await;
        lock.write_all(data.as_bytes()).await?;
        lock.flush().await?;
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let read_half = self.inner.read_half.lock().await.take();
        let Some(mut read_half) = read_half else {
            return Err(crate::Error::Error(
                "TcpConnection::serve_loop called twice".to_string(),
            ));
        };

        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];

        loop {
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    debug!("connection closed: {}", self.inner.remote_addr);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[0..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(msg)) => {
                                let socket = self.inner.remote_addr.get_socketaddr()?;
                                let msg = SipConnection::update_msg_received(
                                    msg,
                                    socket,
                                    rsip::transport::Transport::Tcp,
                                )?;
                                sender.send(TransportEvent::Incoming(
                                    msg,
                                    SipConnection::Tcp(self.clone()),
                                    self.inner.remote_addr.clone(),
                                ))?;
                            }
                            Ok(None) => break,
                            Err(crate::Error::Keepalive) => {
                                let mut lock = self.inner.write_half.lock().await;
                                lock.write_all(KEEPALIVE_RESPONSE).await?;
                                lock.flush().await?;
                            }
                            Err(e) => {
                                warn!(
                                    "error decoding message from {}: {:?}",
                                    self.inner.remote_addr, e
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("error reading from {}: {}", self.inner.remote_addr, e);
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.write_half.lock().await.shutdown().await.ok();
        if let Some(token) = &self.cancel_token {
            token.cancel();
        }
        Ok(())
    }
}

impl std::fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.remote_addr.addr)
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.remote_addr.addr)
    }
}
