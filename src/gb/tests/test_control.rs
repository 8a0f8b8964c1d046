use super::{device_request, start_harness, CHANNEL_ID, DEVICE_ID};
use crate::gb::ptz::{build_ptz_cmd, PTZ_CMD_LEFT};
use crate::transaction::body_text;
use crate::Result;

fn extract_sn(body: &str) -> u32 {
    let start = body.find("<SN>").expect("SN tag") + 4;
    let end = body[start..].find("</SN>").expect("SN close") + start;
    body[start..end].parse().expect("SN number")
}

#[tokio::test]
async fn test_ptz_control_message() -> Result<()> {
    let mut harness = start_harness("").await?;
    harness.seed_device();

    let frame = build_ptz_cmd(PTZ_CMD_LEFT, 0x50, 0x50, 0);
    harness.gb.ptz_control(DEVICE_ID, CHANNEL_ID, &frame).await?;

    let message = match harness.sent().await {
        rsip::SipMessage::Request(req) => req,
        other => panic!("expected MESSAGE, got {}", other),
    };
    assert_eq!(message.method, rsip::Method::Message);
    let body = body_text(&message);
    assert!(body.contains("<CmdType>DeviceControl</CmdType>"), "{}", body);
    assert!(body.contains(&format!("<PTZCmd>{}</PTZCmd>", frame)), "{}", body);
    assert!(
        body.contains(&format!("<DeviceID>{}</DeviceID>", CHANNEL_ID)),
        "control addresses the channel: {}",
        body
    );
    Ok(())
}

#[tokio::test]
async fn test_ptz_unknown_channel() -> Result<()> {
    let harness = start_harness("").await?;
    harness.seed_device();
    let err = harness
        .gb
        .ptz_control(DEVICE_ID, "34020000001310009999", "A50F010000000000")
        .await
        .unwrap_err();
    assert!(matches!(err, crate::Error::ChannelNotExist(_)));
    Ok(())
}

#[tokio::test]
async fn test_alarm_notify_reaches_observers() -> Result<()> {
    let mut harness = start_harness("").await?;
    harness.seed_device();
    let mut alarms = harness.gb.subscribe_alarms();

    let body = format!(
        "<?xml version=\"1.0\"?>\n<Notify><CmdType>Alarm</CmdType><SN>88</SN><DeviceID>{}</DeviceID><AlarmPriority>4</AlarmPriority><AlarmMethod>5</AlarmMethod><AlarmTime>2023-11-14T22:13:20</AlarmTime></Notify>",
        DEVICE_ID
    );
    harness.inject(
        device_request(
            rsip::Method::Message,
            "z9hG4bKalarm1",
            40,
            vec![],
            Some(("Application/MANSCDP+xml".to_string(), body)),
        )
        .into(),
    );
    let resp = harness.sent().await;
    assert!(resp.is_response());

    let alarm = tokio::time::timeout(std::time::Duration::from_secs(2), alarms.recv())
        .await
        .expect("alarm delivery")
        .expect("broadcast open");
    assert_eq!(alarm.device_id, DEVICE_ID);
    assert_eq!(alarm.alarm_priority, "4");
    assert_eq!(alarm.alarm_method, "5");
    Ok(())
}

#[tokio::test]
async fn test_record_query_roundtrip() -> Result<()> {
    let mut harness = start_harness("").await?;
    harness.seed_device();

    let gb = harness.gb.clone();
    let query = tokio::spawn(async move {
        gb.query_record_info(DEVICE_ID, CHANNEL_ID, 1700000000, 1700003600)
            .await
    });

    let message = match harness.sent().await {
        rsip::SipMessage::Request(req) => req,
        other => panic!("expected MESSAGE, got {}", other),
    };
    let body = body_text(&message);
    assert!(body.contains("<CmdType>RecordInfo</CmdType>"), "{}", body);
    assert!(body.contains("<StartTime>2023-11-14T22:13:20</StartTime>"), "{}", body);
    let sn = extract_sn(&body);

    // the device answers in two chunks
    let chunk = |cseq: u32, branch: &str, names: &[&str], sum: usize| {
        let items: String = names
            .iter()
            .map(|n| {
                format!(
                    "<Item><DeviceID>{}</DeviceID><Name>{}</Name><StartTime>2023-11-14T22:13:20</StartTime><EndTime>2023-11-14T23:13:20</EndTime><Type>time</Type></Item>",
                    CHANNEL_ID, n
                )
            })
            .collect();
        let body = format!(
            "<?xml version=\"1.0\"?>\n<Response><CmdType>RecordInfo</CmdType><SN>{}</SN><DeviceID>{}</DeviceID><SumNum>{}</SumNum><RecordList Num=\"{}\">{}</RecordList></Response>",
            sn,
            CHANNEL_ID,
            sum,
            names.len(),
            items
        );
        device_request(
            rsip::Method::Message,
            branch,
            cseq,
            vec![],
            Some(("Application/MANSCDP+xml".to_string(), body)),
        )
    };

    harness.inject(chunk(30, "z9hG4bKrec1", &["morning", "noon"], 3).into());
    harness.sent().await; // 200 to chunk one
    harness.inject(chunk(31, "z9hG4bKrec2", &["evening"], 3).into());
    harness.sent().await; // 200 to chunk two

    let items = query.await.expect("join")?;
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].name, "morning");
    assert_eq!(items[2].name, "evening");
    Ok(())
}
