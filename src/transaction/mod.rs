use crate::transport::SipConnection;
use crate::Result;
use key::TransactionKey;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use transaction::Transaction;

pub mod endpoint;
pub mod key;
mod timer;
pub mod transaction;
pub use endpoint::{Endpoint, EndpointBuilder};
#[cfg(test)]
mod tests;

pub const TO_TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CALL_ID_LEN: usize = 22;

/// Queue of server transactions created from incoming requests.
pub type TransactionReceiver = UnboundedReceiver<Transaction>;
pub type TransactionSender = UnboundedSender<Transaction>;

pub(crate) enum TransactionEvent {
    Received(rsip::SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Terminate,
}

pub(crate) type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub(crate) type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Transaction states per RFC 3261.
///
/// Client INVITE: `Calling → Trying → Proceeding → Completed → Terminated`.
/// Server INVITE visits `Confirmed` between `Completed` and `Terminated`
/// once the ACK arrives. Non-INVITE transactions skip `Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionType {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// RFC 3261 transaction timers.
///
/// * Timer A - client retransmission on unreliable transport, starts at T1
///   and doubles up to T2
/// * Timer B/F - transaction timeout, 32×T1
/// * Timer D - linger in `Completed` absorbing response retransmissions
/// * Timer G - server INVITE final-response retransmission
/// * Timer K - linger in `Confirmed` after the ACK
/// * Cleanup - drops the finished-transaction record kept for replays
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerG(TransactionKey, Duration),
    TimerK(TransactionKey),
    TimerCleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerCleanup(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerA(key, duration) => {
                write!(f, "TimerA: {} {}ms", key, duration.as_millis())
            }
            TransactionTimer::TimerB(key) => write!(f, "TimerB: {}", key),
            TransactionTimer::TimerD(key) => write!(f, "TimerD: {}", key),
            TransactionTimer::TimerG(key, duration) => {
                write!(f, "TimerG: {} {}ms", key, duration.as_millis())
            }
            TransactionTimer::TimerK(key) => write!(f, "TimerK: {}", key),
            TransactionTimer::TimerCleanup(key) => write!(f, "TimerCleanup: {}", key),
        }
    }
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(format!("z9hG4bK{}", random_text(BRANCH_LEN)).into())
}

pub fn make_call_id(domain: &str) -> rsip::headers::CallId {
    format!("{}@{}", random_text(CALL_ID_LEN), domain).into()
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TO_TAG_LEN).into()
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn random_hex(count: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..count)
        .filter_map(|_| std::char::from_digit(rng.gen_range(0..16u32), 16))
        .collect()
}

/// Command sequence numbers for MANSCDP bodies.
pub fn random_sn() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen_range(100_000..1_000_000)
}

/// Block until the transaction delivers a final response.
///
/// Provisional responses are skipped. When Timer B fires first the error is
/// `Error::Timeout`; callers wanting a shorter bound wrap this future in
/// `tokio::time::timeout`.
pub async fn wait_final_response(tx: &mut Transaction) -> Result<rsip::Response> {
    while let Some(msg) = tx.receive().await {
        if let rsip::SipMessage::Response(resp) = msg {
            if resp.status_code.kind() == rsip::StatusCodeKind::Provisional {
                continue;
            }
            return Ok(resp);
        }
    }
    if tx.timed_out {
        Err(crate::Error::Timeout(format!("transaction {}", tx.key)))
    } else {
        Err(crate::Error::Transaction(
            "terminated without final response".to_string(),
            tx.key.clone(),
        ))
    }
}

/// Copy of the message body as UTF-8, for XML dispatch.
pub fn body_text(req: &rsip::Request) -> String {
    String::from_utf8_lossy(&req.body).to_string()
}
