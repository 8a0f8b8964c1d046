use super::{create_test_link, make_test_request, next_sent};
use crate::{transport::TransportEvent, Result};

#[tokio::test]
async fn test_server_transaction_respond_and_replay() -> Result<()> {
    let mut link = create_test_link().await?;
    let endpoint = link.endpoint;
    let mut incoming = endpoint.incoming_transactions();
    let endpoint_task = async { endpoint.serve().await };

    let test = async {
        let request = make_test_request(rsip::Method::Register, "z9hG4bKserver1", 1);
        link.inject_tx.send(TransportEvent::Incoming(
            request.clone().into(),
            link.connection.clone(),
            link.addr.clone(),
        ))?;

        let mut tx = incoming.recv().await.expect("incoming transaction");
        assert_eq!(tx.original.method, rsip::Method::Register);

        let response = crate::transaction::tests::response_for(&tx.original, rsip::StatusCode::OK);
        tx.respond(response).await?;

        let sent = next_sent(&mut link.peer_rx).await;
        match sent {
            rsip::SipMessage::Response(resp) => {
                assert_eq!(resp.status_code, rsip::StatusCode::OK)
            }
            _ => panic!("expected response"),
        }
        drop(tx);

        // a retransmitted REGISTER is absorbed and answered from the
        // finished-transaction record, not surfaced again
        link.inject_tx.send(TransportEvent::Incoming(
            request.clone().into(),
            link.connection.clone(),
            link.addr.clone(),
        ))?;
        let replayed = next_sent(&mut link.peer_rx).await;
        assert!(replayed.is_response());
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(200), incoming.recv())
                .await
                .is_err(),
            "retransmit must not create a second server transaction"
        );
        Ok::<_, crate::Error>(())
    };

    tokio::select! {
        result = test => result?,
        _ = endpoint_task => panic!("endpoint exited early"),
    }
    Ok(())
}

#[tokio::test]
async fn test_ack_is_delivered_as_new_transaction() -> Result<()> {
    let mut link = create_test_link().await?;
    let endpoint = link.endpoint;
    let mut incoming = endpoint.incoming_transactions();
    let endpoint_task = async { endpoint.serve().await };

    let test = async {
        // ACK to a 2xx carries a fresh branch and therefore a fresh key
        let ack = make_test_request(rsip::Method::Ack, "z9hG4bKacknew", 3);
        link.inject_tx.send(TransportEvent::Incoming(
            ack.into(),
            link.connection.clone(),
            link.addr.clone(),
        ))?;
        let tx = incoming.recv().await.expect("ack transaction");
        assert_eq!(tx.original.method, rsip::Method::Ack);
        Ok::<_, crate::Error>(())
    };

    tokio::select! {
        result = test => result?,
        _ = endpoint_task => panic!("endpoint exited early"),
    }
    Ok(())
}
