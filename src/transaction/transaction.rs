use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::{
    TransactionEvent, TransactionEventReceiver, TransactionEventSender, TransactionState,
    TransactionTimer, TransactionType,
};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use rsip::{Method, Request, Response, SipMessage};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{trace, warn};

pub(super) const T1: Duration = Duration::from_millis(500);
pub(super) const T2: Duration = Duration::from_secs(4);
pub(super) const T4: Duration = Duration::from_secs(5);
/// Timer B/F transaction timeout, 32×T1.
pub(super) const TIMER_F: Duration = Duration::from_millis(32 * 500);
pub(super) const TIMER_INTERVAL: Duration = Duration::from_millis(20);

/// A single client or server transaction.
///
/// Client transactions are created by `Endpoint::client_transaction`, sent
/// with `send` and observed through `receive`. Server transactions arrive on
/// the endpoint's incoming queue with the original request already parsed;
/// the owner answers through `respond`. Retransmission and timeout behavior
/// follows RFC 3261 §17 with retransmits suppressed on reliable transports.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    /// Explicit next-hop; when unset the request URI decides.
    pub destination: Option<SipAddr>,
    /// Set when Timer B fired before a final response.
    pub timed_out: bool,
    pub(super) endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    pub(super) last_response: Option<Response>,
    pub(super) last_ack: Option<Request>,
    tu_receiver: TransactionEventReceiver,
    pub(super) tu_sender: TransactionEventSender,
    timer_a: Option<u64>,
    timer_b: Option<u64>,
    timer_g: Option<u64>,
    wait_timer: Option<u64>,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        connection: Option<SipConnection>,
        endpoint_inner: EndpointInnerRef,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = if transaction_type.is_client() {
            TransactionState::Calling
        } else {
            TransactionState::Trying
        };
        Self {
            transaction_type,
            key,
            original,
            state,
            destination: None,
            timed_out: false,
            endpoint_inner,
            connection,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            timer_a: None,
            timer_b: None,
            timer_g: None,
            wait_timer: None,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(tx_type, key, original, connection, endpoint_inner)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        let tx = Transaction::new(tx_type, key, original, connection, endpoint_inner);
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        tx
    }

    /// Send the original request (client transactions).
    pub async fn send(&mut self) -> Result<()> {
        if !self.transaction_type.is_client() {
            return Err(Error::Transaction(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }

        if self.connection.is_none() {
            let target = match &self.destination {
                Some(addr) => addr.clone(),
                None => SipAddr::try_from(&self.original.uri)?,
            };
            let connection = self.endpoint_inner.transport_layer.lookup(&target).await?;
            self.connection.replace(connection);
        }

        let connection = self.connection.as_ref().ok_or(Error::Transaction(
            "no connection found".to_string(),
            self.key.clone(),
        ))?;

        // attach first so a fast response cannot slip past the table
        self.endpoint_inner
            .attach_transaction(&self.key, self.tu_sender.clone());
        if let Err(e) = connection
            .send(self.original.to_owned().into(), self.destination.as_ref())
            .await
        {
            self.endpoint_inner.detach_transaction(&self.key, None);
            return Err(e);
        }
        self.transition(TransactionState::Trying).map(|_| ())
    }

    /// Send a response (server transactions). Final responses advance the
    /// state machine; provisional ones only mark progress.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.transaction_type.is_client() {
            return Err(Error::Transaction(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }

        let connection = self.connection.as_ref().ok_or(Error::Transaction(
            "no connection found".to_string(),
            self.key.clone(),
        ))?;

        connection.send(response.to_owned().into(), None).await?;
        match response.status_code.kind() {
            rsip::StatusCodeKind::Provisional => {
                self.transition(TransactionState::Proceeding).map(|_| ())
            }
            _ => {
                self.last_response.replace(response);
                match self.transaction_type {
                    TransactionType::ServerInvite => {
                        self.transition(TransactionState::Completed).map(|_| ())
                    }
                    _ => self.transition(TransactionState::Terminated).map(|_| ()),
                }
            }
        }
    }

    /// Acknowledge a 2xx final response (client INVITE transactions).
    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::Transaction(
                "send_ack is only valid for client INVITE transactions".to_string(),
                self.key.clone(),
            ));
        }

        let connection = self.connection.as_ref().ok_or(Error::Transaction(
            "no connection found".to_string(),
            self.key.clone(),
        ))?;

        connection
            .send(ack.to_owned().into(), self.destination.as_ref())
            .await?;
        self.last_ack.replace(ack);
        self.transition(TransactionState::Terminated).map(|_| ())
    }

    /// Last final response seen, if any. A caller whose deadline expired
    /// can still find a late 2xx here and acknowledge it.
    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    /// Next protocol event for the transaction user: a response (client) or
    /// an in-transaction request such as the ACK (server). Returns `None`
    /// once the transaction terminates.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection) => {
                    let delivered = match msg {
                        SipMessage::Request(req) => {
                            self.on_received_request(req, connection).await
                        }
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    };
                    if delivered.is_some() {
                        return delivered;
                    }
                }
                TransactionEvent::Timer(timer) => {
                    self.on_timer(timer).await.ok();
                }
                TransactionEvent::Terminate => {
                    return None;
                }
            }
        }
        None
    }

    async fn on_received_request(
        &mut self,
        req: Request,
        connection: Option<SipConnection>,
    ) -> Option<SipMessage> {
        if self.transaction_type.is_client() {
            return None;
        }
        if req.method == Method::Ack {
            if self.state == TransactionState::Completed {
                self.transition(TransactionState::Confirmed).ok();
            }
            return Some(SipMessage::Request(req));
        }
        // retransmission of the original request: replay the last response
        if req.method == self.original.method {
            if let Some(last_response) = self.last_response.clone() {
                let target = connection.or_else(|| self.connection.clone());
                if let Some(target) = target {
                    target.send(last_response.into(), None).await.ok();
                }
            }
        }
        None
    }

    async fn on_received_response(&mut self, resp: Response) -> Option<SipMessage> {
        if !self.transaction_type.is_client() {
            return None;
        }
        match resp.status_code.kind() {
            rsip::StatusCodeKind::Provisional => {
                if matches!(
                    self.state,
                    TransactionState::Calling | TransactionState::Trying
                ) {
                    self.transition(TransactionState::Proceeding).ok();
                }
                Some(SipMessage::Response(resp))
            }
            _ => {
                if self.state == TransactionState::Terminated {
                    return None;
                }
                self.last_response.replace(resp.clone());
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        // stays around until the TU sends the ACK
                        self.transition(TransactionState::Completed).ok();
                    }
                    _ => {
                        self.transition(TransactionState::Terminated).ok();
                    }
                }
                Some(SipMessage::Response(resp))
            }
        }
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match timer {
            TransactionTimer::TimerA(key, duration) => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Calling
                ) {
                    if let Some(connection) = &self.connection {
                        connection
                            .send(self.original.to_owned().into(), self.destination.as_ref())
                            .await?;
                    }
                    let duration = (duration * 2).min(T2);
                    let timer_a = self
                        .endpoint_inner
                        .timers
                        .timeout(duration, TransactionTimer::TimerA(key, duration));
                    self.timer_a.replace(timer_a);
                }
            }
            TransactionTimer::TimerB(_) => {
                if !matches!(
                    self.state,
                    TransactionState::Completed
                        | TransactionState::Confirmed
                        | TransactionState::Terminated
                ) {
                    self.timed_out = true;
                    warn!("transaction timeout: {}", self.key);
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerG(key, duration) => {
                if self.state == TransactionState::Completed {
                    if let (Some(connection), Some(last_response)) =
                        (&self.connection, self.last_response.clone())
                    {
                        connection.send(last_response.into(), None).await?;
                    }
                    let duration = (duration * 2).min(T2);
                    let timer_g = self
                        .endpoint_inner
                        .timers
                        .timeout(duration, TransactionTimer::TimerG(key, duration));
                    self.timer_g.replace(timer_g);
                }
            }
            TransactionTimer::TimerD(_) | TransactionTimer::TimerK(_) => {
                self.transition(TransactionState::Terminated)?;
            }
            TransactionTimer::TimerCleanup(_) => {}
        }
        Ok(())
    }

    fn transition(&mut self, state: TransactionState) -> Result<TransactionState> {
        if self.state == state {
            return Ok(self.state);
        }
        match state {
            TransactionState::Calling => {}
            TransactionState::Trying => {
                let reliable = self
                    .connection
                    .as_ref()
                    .map(|c| c.is_reliable())
                    .unwrap_or(false);
                if !reliable && self.transaction_type.is_client() {
                    self.timer_a
                        .take()
                        .map(|id| self.endpoint_inner.timers.cancel(id));
                    self.timer_a.replace(self.endpoint_inner.timers.timeout(
                        T1,
                        TransactionTimer::TimerA(self.key.clone(), T1),
                    ));
                }
                if self.transaction_type.is_client() {
                    self.timer_b
                        .take()
                        .map(|id| self.endpoint_inner.timers.cancel(id));
                    self.timer_b.replace(
                        self.endpoint_inner
                            .timers
                            .timeout(TIMER_F, TransactionTimer::TimerB(self.key.clone())),
                    );
                }
            }
            TransactionState::Proceeding => {
                self.timer_a
                    .take()
                    .map(|id| self.endpoint_inner.timers.cancel(id));
            }
            TransactionState::Completed => {
                self.timer_a
                    .take()
                    .map(|id| self.endpoint_inner.timers.cancel(id));
                self.timer_b
                    .take()
                    .map(|id| self.endpoint_inner.timers.cancel(id));
                let reliable = self
                    .connection
                    .as_ref()
                    .map(|c| c.is_reliable())
                    .unwrap_or(false);
                if self.transaction_type == TransactionType::ServerInvite && !reliable {
                    self.timer_g.replace(self.endpoint_inner.timers.timeout(
                        T1,
                        TransactionTimer::TimerG(self.key.clone(), T1),
                    ));
                }
                self.wait_timer.replace(
                    self.endpoint_inner
                        .timers
                        .timeout(TIMER_F, TransactionTimer::TimerD(self.key.clone())),
                );
            }
            TransactionState::Confirmed => {
                self.cleanup_timers();
                self.wait_timer.replace(
                    self.endpoint_inner
                        .timers
                        .timeout(T4, TransactionTimer::TimerK(self.key.clone())),
                );
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
        }
        trace!("{} transition: {} -> {}", self.key, self.state, state);
        self.state = state;
        Ok(self.state)
    }

    fn cleanup_timers(&mut self) {
        let ids = [
            self.timer_a.take(),
            self.timer_b.take(),
            self.timer_g.take(),
            self.wait_timer.take(),
        ];
        for id in ids.into_iter().flatten() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cleanup(&mut self) {
        if self.state == TransactionState::Calling {
            return;
        }
        self.cleanup_timers();
        let last_message = match self.transaction_type {
            // a retransmitted 2xx must be answered with the same ACK
            TransactionType::ClientInvite => {
                self.last_ack.take().map(SipMessage::Request)
            }
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {
                self.last_response.take().map(SipMessage::Response)
            }
            TransactionType::ClientNonInvite => None,
        };
        self.endpoint_inner
            .detach_transaction(&self.key, last_message);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
    }
}
