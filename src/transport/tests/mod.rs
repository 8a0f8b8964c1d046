use crate::{
    transport::{udp::UdpConnection, SipConnection, TransportEvent},
    Result,
};
use tokio::sync::mpsc::unbounded_channel;

fn sample_register(branch: &str) -> rsip::SipMessage {
    let msg = format!(
        "REGISTER sip:3402000000@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 192.168.1.2:5060;branch={}\r\n\
         From: <sip:34020000001320000001@3402000000>;tag=sender\r\n\
         To: <sip:34020000001320000001@3402000000>\r\n\
         Call-ID: transport-test@127.0.0.1\r\n\
         CSeq: 1 REGISTER\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        branch
    );
    rsip::SipMessage::try_from(msg.as_str()).expect("parse sample register")
}

#[tokio::test]
async fn test_udp_recv_patches_via_received() -> Result<()> {
    let server = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
    let client = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;

    let (sender, mut receiver) = unbounded_channel();
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.serve_loop(sender).await.ok();
    });

    let target = server.get_addr().clone();
    client
        .send(sample_register("z9hG4bKudp1"), Some(&target))
        .await?;

    let event = receiver.recv().await.expect("incoming event");
    match event {
        TransportEvent::Incoming(msg, connection, source) => {
            assert!(connection.get_addr().r#type == Some(rsip::transport::Transport::Udp));
            assert_eq!(source.addr.host.to_string(), "127.0.0.1");
            // the sender advertised 192.168.1.2 but really sent from 127.0.0.1
            let via = match &msg {
                rsip::SipMessage::Request(req) => {
                    use rsip::prelude::HeadersExt;
                    req.via_header().expect("via").to_string()
                }
                _ => panic!("expected request"),
            };
            assert!(via.contains("received=127.0.0.1"), "via: {}", via);
            assert!(via.contains("rport="), "via: {}", via);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_udp_answers_keepalive_probe() -> Result<()> {
    let server = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
    let (sender, _receiver) = unbounded_channel();
    let server_clone = server.clone();
    tokio::spawn(async move {
        server_clone.serve_loop(sender).await.ok();
    });

    let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let target = server.get_addr().get_socketaddr()?;
    probe.send_to(b"\r\n\r\n", target).await?;

    let mut buf = [0u8; 8];
    let (n, _) = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        probe.recv_from(&mut buf),
    )
    .await
    .expect("keepalive answer")?;
    assert_eq!(&buf[..n], b"\r\n");
    Ok(())
}

#[tokio::test]
async fn test_response_destination_prefers_via_received() -> Result<()> {
    let msg = "SIP/2.0 200 OK\r\n\
         Via: SIP/2.0/UDP 192.168.1.2:5060;branch=z9hG4bKx;received=10.0.0.9;rport=12345\r\n\
         From: <sip:a@3402000000>;tag=x\r\n\
         To: <sip:b@3402000000>;tag=y\r\n\
         Call-ID: dest@test\r\n\
         CSeq: 1 MESSAGE\r\n\
         Content-Length: 0\r\n\r\n";
    let msg = rsip::SipMessage::try_from(msg)?;
    let dest = SipConnection::get_destination(&msg)?;
    assert_eq!(dest.to_string(), "10.0.0.9:12345");
    Ok(())
}
