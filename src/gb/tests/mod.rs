use crate::config::{MediaConfig, SipConfig};
use crate::gb::device::{Channel, Device, DeviceEntry, Registry};
use crate::gb::{GbServer, GbServerRef};
use crate::store::MemoryStore;
use crate::transaction::EndpointBuilder;
use crate::transport::{
    channel::ChannelConnection, SipAddr, SipConnection, TransportEvent, TransportLayer,
    TransportReceiver, TransportSender,
};
use crate::zlm::MediaClient;
use crate::Result;
use axum::{routing::post, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

mod test_control;
mod test_session;

pub const DEVICE_ID: &str = "34020000001320000001";
pub const CHANNEL_ID: &str = "34020000001310000001";

pub struct Harness {
    pub gb: GbServerRef,
    pub inject_tx: TransportSender,
    pub peer_rx: TransportReceiver,
    pub connection: SipConnection,
    pub addr: SipAddr,
}

async fn stub_relay() -> String {
    let router = Router::new()
        .route(
            "/index/api/openRtpServer",
            post(|| async { Json(json!({"code": 0, "port": 30002})) }),
        )
        .route(
            "/index/api/closeRtpServer",
            post(|| async { Json(json!({"code": 0})) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub relay");
    let addr = listener.local_addr().expect("relay addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{}", addr)
}

pub async fn start_harness(password: &str) -> Result<Harness> {
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

    let endpoint = Arc::new(
        EndpointBuilder::new()
            .transport_layer(transport_layer)
            .cancel_token(cancel_token)
            .build(),
    );

    let cfg = SipConfig {
        password: password.to_string(),
        ..Default::default()
    };
    let media_cfg = MediaConfig {
        sdp_ip: "127.0.0.1".to_string(),
        ..Default::default()
    };

    let relay_url = stub_relay().await;
    let zlm = Arc::new(MediaClient::with_base_url(&relay_url, "secret"));

    let gb = GbServer::new(
        cfg,
        media_cfg,
        endpoint.clone(),
        Arc::new(Registry::new()),
        Arc::new(MemoryStore::new()),
        zlm,
    );

    let serve_endpoint = endpoint.clone();
    tokio::spawn(async move {
        serve_endpoint.serve().await.ok();
    });
    let serve_gb = gb.clone();
    tokio::spawn(async move {
        serve_gb.serve().await;
    });

    Ok(Harness {
        gb,
        inject_tx,
        peer_rx,
        connection,
        addr,
    })
}

impl Harness {
    pub fn inject(&self, msg: rsip::SipMessage) {
        self.inject_tx
            .send(TransportEvent::Incoming(
                msg,
                self.connection.clone(),
                self.addr.clone(),
            ))
            .expect("inject");
    }

    /// Next message the gateway sent toward the device.
    pub async fn sent(&mut self) -> rsip::SipMessage {
        match tokio::time::timeout(std::time::Duration::from_secs(3), self.peer_rx.recv())
            .await
            .expect("timed out waiting for gateway output")
            .expect("transport closed")
        {
            TransportEvent::Incoming(msg, _, _) => msg,
            other => panic!("unexpected transport event: {:?}", other),
        }
    }

    /// Seed an online device wired to the loopback connection, plus one
    /// channel with internal id `ch123`.
    pub fn seed_device(&self) {
        let mut device = Device::new("gbtest0000000001", DEVICE_ID);
        device.is_online = true;
        device.stream_mode = 1;
        let mut entry = DeviceEntry::new(device);
        entry.source = Some(self.addr.clone());
        entry.connection = Some(self.connection.clone());
        self.gb.registry.store(entry);

        let mut channel = Channel::new(DEVICE_ID, CHANNEL_ID);
        channel.id = "ch123".to_string();
        channel.did = "gbtest0000000001".to_string();
        channel.is_online = true;
        self.gb.registry.store_channel(channel);
    }
}

pub fn device_request(
    method: rsip::Method,
    branch: &str,
    cseq: u32,
    extra_headers: Vec<rsip::Header>,
    body: Option<(String, String)>,
) -> rsip::Request {
    use rsip::headers::*;
    let mut headers: Vec<rsip::Header> = vec![
        Via::new(format!("SIP/2.0/UDP 127.0.0.1:15061;branch={}", branch)).into(),
        From::new(format!("<sip:{}@3402000000>;tag=devicetag", DEVICE_ID)).into(),
        To::new(format!("<sip:{}@3402000000>", DEVICE_ID)).into(),
        CallId::new(format!("{}@device", branch)).into(),
        CSeq::new(format!("{} {}", cseq, method)).into(),
        Contact::new(format!("<sip:{}@127.0.0.1:15061>", DEVICE_ID)).into(),
        rsip::Header::MaxForwards(70.into()),
    ];
    headers.extend(extra_headers);
    let body = match body {
        Some((content_type, text)) => {
            headers.push(ContentType::new(content_type).into());
            headers.push(rsip::Header::ContentLength((text.len() as u32).into()));
            text.into_bytes()
        }
        None => {
            headers.push(rsip::Header::ContentLength(0.into()));
            Vec::new()
        }
    };
    rsip::Request {
        method,
        uri: rsip::Uri::try_from("sip:34020000002000000001@3402000000").expect("uri"),
        headers: headers.into(),
        version: rsip::Version::V2,
        body,
    }
}

pub fn keepalive_message(branch: &str, cseq: u32, status: &str) -> rsip::Request {
    let body = format!(
        "<?xml version=\"1.0\"?>\n<Notify>\n<CmdType>Keepalive</CmdType>\n<SN>42</SN>\n<DeviceID>{}</DeviceID>\n<Status>{}</Status>\n</Notify>",
        DEVICE_ID, status
    );
    device_request(
        rsip::Method::Message,
        branch,
        cseq,
        vec![],
        Some(("Application/MANSCDP+xml".to_string(), body)),
    )
}

pub fn catalog_message(branch: &str, cseq: u32, sn: u32, sum: usize, ids: &[&str]) -> rsip::Request {
    let items: String = ids
        .iter()
        .map(|id| {
            format!(
                "<Item><DeviceID>{}</DeviceID><Name>cam {}</Name><Status>ON</Status></Item>",
                id, id
            )
        })
        .collect();
    let body = format!(
        "<?xml version=\"1.0\"?>\n<Response><CmdType>Catalog</CmdType><SN>{}</SN><DeviceID>{}</DeviceID><SumNum>{}</SumNum><DeviceList Num=\"{}\">{}</DeviceList></Response>",
        sn,
        DEVICE_ID,
        sum,
        ids.len(),
        items
    );
    device_request(
        rsip::Method::Message,
        branch,
        cseq,
        vec![],
        Some(("Application/MANSCDP+xml".to_string(), body)),
    )
}

/// The camera's 200 to an INVITE: transaction headers echoed, To-tag and
/// Contact added, SDP answer attached.
pub fn invite_ok(req: &rsip::Request) -> rsip::Response {
    use rsip::prelude::{HeadersExt, UntypedHeader};
    use rsip::Header;
    let mut headers: Vec<Header> = Vec::new();
    headers.push(Header::Via(req.via_header().expect("via").clone()));
    headers.push(Header::From(req.from_header().expect("from").clone()));
    let to = req.to_header().expect("to");
    headers.push(Header::To(rsip::headers::To::new(format!(
        "{};tag=cameratag",
        to.value()
    ))));
    headers.push(Header::CallId(req.call_id_header().expect("call id").clone()));
    headers.push(Header::CSeq(req.cseq_header().expect("cseq").clone()));
    headers.push(Header::Contact(rsip::headers::Contact::new(format!(
        "<sip:{}@127.0.0.1:15061>",
        CHANNEL_ID
    ))));
    let body = b"v=0\r\no=camera 0 0 IN IP4 127.0.0.1\r\ns=Play\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=video 40000 TCP/RTP/AVP 96\r\n".to_vec();
    headers.push(Header::ContentType("APPLICATION/SDP".into()));
    headers.push(Header::ContentLength((body.len() as u32).into()));
    rsip::Response {
        status_code: rsip::StatusCode::OK,
        headers: headers.into(),
        version: rsip::Version::V2,
        body,
    }
}
