use crate::{
    transaction::{endpoint::Endpoint, EndpointBuilder},
    transport::{
        channel::ChannelConnection, SipAddr, SipConnection, TransportEvent, TransportLayer,
        TransportReceiver, TransportSender,
    },
    Result,
};
use rsip::headers::UntypedHeader;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

mod test_client;
mod test_server;

/// An endpoint wired to an in-memory channel: `peer_rx` observes what the
/// endpoint transmits, `inject_tx` feeds it traffic.
pub struct TestLink {
    pub endpoint: Endpoint,
    pub peer_rx: TransportReceiver,
    pub inject_tx: TransportSender,
    pub connection: SipConnection,
    pub addr: SipAddr,
}

pub async fn create_test_link() -> Result<TestLink> {
    let cancel_token = CancellationToken::new();
    let (inject_tx, inject_rx) = unbounded_channel();
    let (peer_tx, peer_rx) = unbounded_channel();

    let addr = SipAddr {
        r#type: Some(rsip::transport::Transport::Udp),
        addr: rsip::HostWithPort::try_from("127.0.0.1:15060")?,
    };
    let connection: SipConnection =
        ChannelConnection::create_connection(inject_rx, peer_tx, addr.clone())
            .await?
            .into();

    let transport_layer = TransportLayer::new(cancel_token.child_token());
    transport_layer.add_transport(connection.clone());

    let endpoint = EndpointBuilder::new()
        .transport_layer(transport_layer)
        .cancel_token(cancel_token)
        .build();

    Ok(TestLink {
        endpoint,
        peer_rx,
        inject_tx,
        connection,
        addr,
    })
}

pub fn make_test_request(method: rsip::Method, branch: &str, cseq: u32) -> rsip::Request {
    use rsip::headers::*;
    rsip::Request {
        method,
        uri: rsip::Uri::try_from("sip:34020000001320000001@127.0.0.1:15061").expect("uri"),
        headers: vec![
            Via::new(format!("SIP/2.0/UDP 127.0.0.1:15060;branch={}", branch)).into(),
            From::new("<sip:34020000002000000001@3402000000>;tag=gbgate").into(),
            To::new("<sip:34020000001320000001@3402000000>").into(),
            CallId::new(format!("{}@test", branch)).into(),
            CSeq::new(format!("{} {}", cseq, method)).into(),
            rsip::Header::MaxForwards(70.into()),
            rsip::Header::ContentLength(0.into()),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

pub fn response_for(req: &rsip::Request, status: rsip::StatusCode) -> rsip::Response {
    use rsip::Header;
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CallId(_)
                | Header::CSeq(_)
        )
    });
    if status != rsip::StatusCode::Trying {
        headers.retain(|h| !matches!(h, Header::To(_)));
        headers.push(Header::To(
            rsip::headers::To::new("<sip:34020000001320000001@3402000000>;tag=device").into(),
        ));
    }
    rsip::Response {
        status_code: status,
        headers,
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

/// Next SIP message the endpoint put on the wire.
pub async fn next_sent(peer_rx: &mut TransportReceiver) -> rsip::SipMessage {
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(2), peer_rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("transport channel closed")
        {
            TransportEvent::Incoming(msg, _, _) => return msg,
            _ => continue,
        }
    }
}
