use super::{
    key::TransactionKey,
    timer::Timer,
    transaction::{Transaction, TIMER_F, TIMER_INTERVAL, T4},
    TransactionEvent, TransactionEventSender, TransactionReceiver, TransactionSender,
    TransactionTimer,
};
use crate::transport::{SipAddr, TransportEvent, TransportLayer, TransportReceiver};
use crate::{Error, Result};
use rsip::SipMessage;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{select, sync::mpsc::unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "gbgate/0.1";

pub struct EndpointInner {
    pub user_agent: String,
    pub(crate) timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub(super) transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    pub(super) finished_transactions: Mutex<HashMap<TransactionKey, Option<SipMessage>>>,
    incoming_sender: TransactionSender,
    cancel_token: CancellationToken,
    timer_interval: Duration,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// The transaction-layer endpoint.
///
/// Owns the transport layer, the shared timer wheel and the transaction
/// table. `serve` pumps timers and transport events; new incoming requests
/// become server transactions on the queue returned by
/// `incoming_transactions`.
pub struct Endpoint {
    inner: EndpointInnerRef,
    cancel_token: CancellationToken,
    incoming_receiver: Mutex<Option<TransactionReceiver>>,
}

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    timer_interval: Option<Duration>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: USER_AGENT.to_string(),
            transport_layer: None,
            cancel_token: None,
            timer_interval: None,
        }
    }

    pub fn user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        self.timer_interval.replace(timer_interval);
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let transport_layer = self
            .transport_layer
            .take()
            .expect("transport_layer is required");
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let (incoming_sender, incoming_receiver) = unbounded_channel();

        let inner = Arc::new(EndpointInner {
            user_agent: self.user_agent.clone(),
            timers: Timer::new(),
            transport_layer,
            transactions: Mutex::new(HashMap::new()),
            finished_transactions: Mutex::new(HashMap::new()),
            incoming_sender,
            cancel_token: cancel_token.child_token(),
            timer_interval: self.timer_interval.unwrap_or(TIMER_INTERVAL),
        });

        Endpoint {
            inner,
            cancel_token,
            incoming_receiver: Mutex::new(Some(incoming_receiver)),
        }
    }
}

impl Endpoint {
    /// Run the endpoint until cancelled. Binding failures surface as
    /// errors; the caller treats them as fatal.
    pub async fn serve(&self) -> Result<()> {
        let (transport_sender, transport_receiver) = unbounded_channel();
        self.inner
            .transport_layer
            .serve_listens(transport_sender)
            .await?;

        select! {
            _ = self.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            },
            _ = self.inner.process_timer() => {},
            result = self.inner.process_transport_events(transport_receiver) => {
                if let Err(e) = result {
                    warn!("transport event loop exited: {}", e);
                }
            },
        }
        info!("endpoint shutdown");
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.cancel_token.cancel();
    }

    pub fn inner_ref(&self) -> EndpointInnerRef {
        self.inner.clone()
    }

    pub fn client_transaction(&self, request: rsip::Request) -> Result<Transaction> {
        let key = (&request).try_into()?;
        Ok(Transaction::new_client(key, request, self.inner.clone(), None))
    }

    /// The queue of server transactions; may be taken once.
    pub fn incoming_transactions(&self) -> TransactionReceiver {
        self.incoming_receiver
            .lock()
            .unwrap()
            .take()
            .expect("incoming_transactions may only be taken once")
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.transport_layer.get_addrs()
    }

    pub fn get_via(
        &self,
        addr: Option<SipAddr>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        self.inner.get_via(addr, branch)
    }
}

impl EndpointInner {
    pub(super) async fn process_timer(&self) -> Result<()> {
        while !self.cancel_token.is_cancelled() {
            for timer in self.timers.poll(Instant::now()) {
                if let TransactionTimer::TimerCleanup(key) = timer {
                    self.transactions.lock().unwrap().remove(&key);
                    self.finished_transactions.lock().unwrap().remove(&key);
                    continue;
                }
                let sender = self
                    .transactions
                    .lock()
                    .unwrap()
                    .get(timer.key())
                    .cloned();
                if let Some(sender) = sender {
                    // a failed send means the transaction was dropped
                    sender.send(TransactionEvent::Timer(timer)).ok();
                }
            }
            tokio::time::sleep(self.timer_interval).await;
        }
        Ok(())
    }

    async fn process_transport_events(
        self: &Arc<Self>,
        mut receiver: TransportReceiver,
    ) -> Result<()> {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Incoming(msg, connection, source) => {
                    match msg {
                        SipMessage::Request(req) => {
                            let key = match TransactionKey::try_from(&req) {
                                Ok(key) => key,
                                Err(e) => {
                                    debug!("dropping request without key from {}: {}", source, e);
                                    continue;
                                }
                            };
                            let sender = self.transactions.lock().unwrap().get(&key).cloned();
                            if let Some(sender) = sender {
                                sender
                                    .send(TransactionEvent::Received(
                                        SipMessage::Request(req),
                                        Some(connection),
                                    ))
                                    .ok();
                                continue;
                            }
                            // absorbed retransmit of a finished transaction:
                            // replay whatever we answered it with
                            let finished = self
                                .finished_transactions
                                .lock()
                                .unwrap()
                                .get(&key)
                                .cloned();
                            if let Some(last) = finished {
                                if let Some(last) = last {
                                    connection.send(last, None).await.ok();
                                }
                                continue;
                            }
                            let tx = Transaction::new_server(
                                key,
                                req,
                                self.clone(),
                                Some(connection),
                            );
                            self.incoming_sender.send(tx).ok();
                        }
                        SipMessage::Response(resp) => {
                            let key = match TransactionKey::try_from(&resp) {
                                Ok(key) => key,
                                Err(e) => {
                                    debug!("dropping response without key from {}: {}", source, e);
                                    continue;
                                }
                            };
                            let sender = self.transactions.lock().unwrap().get(&key).cloned();
                            match sender {
                                Some(sender) => {
                                    sender
                                        .send(TransactionEvent::Received(
                                            SipMessage::Response(resp),
                                            Some(connection),
                                        ))
                                        .ok();
                                }
                                None => {
                                    debug!("stray response from {}: {}", source, key);
                                }
                            }
                        }
                    }
                }
                TransportEvent::New(connection) => {
                    debug!("new connection: {}", connection);
                    self.transport_layer.add_connection(connection);
                }
                TransportEvent::Closed(connection) => {
                    debug!("connection closed: {}", connection);
                    self.transport_layer.del_connection(connection.get_addr());
                }
            }
        }
        Err(Error::Error("transport event channel closed".to_string()))
    }

    pub(super) fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.transactions.lock().unwrap().insert(key.clone(), sender);
    }

    pub(super) fn detach_transaction(
        &self,
        key: &TransactionKey,
        last_message: Option<SipMessage>,
    ) {
        self.transactions.lock().unwrap().remove(key);

        if let Some(msg) = last_message {
            if self
                .finished_transactions
                .lock()
                .unwrap()
                .contains_key(key)
            {
                return;
            }
            let linger = if matches!(msg, SipMessage::Request(_)) {
                T4
            } else {
                TIMER_F
            };
            self.timers
                .timeout(linger, TransactionTimer::TimerCleanup(key.clone()));
            self.finished_transactions
                .lock()
                .unwrap()
                .insert(key.clone(), Some(msg));
        }
    }

    /// Via for an outbound request, using the given or first listen address.
    pub fn get_via(
        &self,
        addr: Option<SipAddr>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = addr
            .or_else(|| self.transport_layer.get_addrs().into_iter().next())
            .ok_or_else(|| Error::Error("no listen address for Via".to_string()))?;
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.r#type.unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: addr.addr,
                ..Default::default()
            },
            params: vec![
                branch.unwrap_or_else(super::make_via_branch),
                rsip::Param::Other(rsip::param::OtherParam::new("rport"), None),
            ],
        })
    }
}
