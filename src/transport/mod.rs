pub mod channel;
pub mod connection;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
pub mod transport_layer;
pub mod udp;

pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};
pub use sip_addr::SipAddr;
pub use tcp::TcpConnection;
pub use tcp_listener::TcpListenerConnection;
pub use transport_layer::TransportLayer;
pub use udp::UdpConnection;

#[cfg(test)]
mod tests;
