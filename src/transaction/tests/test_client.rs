use super::{create_test_link, make_test_request, next_sent, response_for};
use crate::{
    transaction::wait_final_response,
    transport::TransportEvent,
    Result,
};
use std::time::Duration;

#[tokio::test]
async fn test_client_transaction_final_response() -> Result<()> {
    let mut link = create_test_link().await?;
    let endpoint = link.endpoint;
    let endpoint_task = async { endpoint.serve().await };

    let test = async {
        let request = make_test_request(rsip::Method::Message, "z9hG4bKclient1", 1);
        let mut tx = endpoint.client_transaction(request.clone())?;
        tx.send().await?;

        let sent = next_sent(&mut link.peer_rx).await;
        assert!(sent.is_request());

        // device answers 100 then 200
        link.inject_tx.send(TransportEvent::Incoming(
            response_for(&request, rsip::StatusCode::Trying).into(),
            link.connection.clone(),
            link.addr.clone(),
        ))?;
        link.inject_tx.send(TransportEvent::Incoming(
            response_for(&request, rsip::StatusCode::OK).into(),
            link.connection.clone(),
            link.addr.clone(),
        ))?;

        let resp = wait_final_response(&mut tx).await?;
        assert_eq!(resp.status_code, rsip::StatusCode::OK);
        Ok::<_, crate::Error>(())
    };

    tokio::select! {
        result = test => result?,
        _ = endpoint_task => panic!("endpoint exited early"),
    }
    Ok(())
}

#[tokio::test]
async fn test_client_transaction_retransmits_on_unreliable() -> Result<()> {
    let mut link = create_test_link().await?;
    let endpoint = link.endpoint;
    let endpoint_task = async { endpoint.serve().await };

    let test = async {
        let request = make_test_request(rsip::Method::Message, "z9hG4bKretrans", 2);
        let mut tx = endpoint.client_transaction(request.clone())?;
        tx.send().await?;

        // initial send plus the first Timer A retransmission at T1
        let first = next_sent(&mut link.peer_rx).await;
        let second = next_sent(&mut link.peer_rx).await;
        assert!(first.is_request());
        assert!(second.is_request());

        // a final response stops the retransmit schedule
        link.inject_tx.send(TransportEvent::Incoming(
            response_for(&request, rsip::StatusCode::OK).into(),
            link.connection.clone(),
            link.addr.clone(),
        ))?;
        let resp = wait_final_response(&mut tx).await?;
        assert_eq!(resp.status_code, rsip::StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(
            link.peer_rx.try_recv().is_err(),
            "no retransmission after the final response"
        );
        Ok::<_, crate::Error>(())
    };

    tokio::select! {
        result = test => result?,
        _ = endpoint_task => panic!("endpoint exited early"),
    }
    Ok(())
}
