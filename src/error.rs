use crate::{transaction::key::TransactionKey, transport::SipAddr};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessage(#[from] rsip::Error),

    #[error("DNS resolution error: {0}")]
    DnsResolution(String),

    #[error("transport layer error: {0}: {1}")]
    TransportLayer(String, SipAddr),

    #[error("transaction error: {0}: {1}")]
    Transaction(String, TransactionKey),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("device not exist: {0}")]
    DeviceNotExist(String),

    #[error("channel not exist: {0}")]
    ChannelNotExist(String),

    #[error("device offline: {0}")]
    DeviceOffline(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("auth failed: {0}")]
    Auth(String),

    #[error("media relay error {code}: {msg}")]
    Upstream { code: i64, msg: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("XML body error: {0}")]
    Xml(String),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    // Codec marker for TCP keepalive probes, never surfaced to callers.
    #[error("keepalive probe")]
    Keepalive,

    #[error("{0}")]
    Error(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSend(e.to_string())
    }
}

impl From<quick_xml::DeError> for Error {
    fn from(e: quick_xml::DeError) -> Self {
        Error::Xml(e.to_string())
    }
}
