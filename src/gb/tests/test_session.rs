use super::{invite_ok, start_harness, CHANNEL_ID, DEVICE_ID};
use crate::gb::{PlaybackAction, PlaybackInput, PlayInput};
use crate::transaction::body_text;
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};

#[tokio::test]
async fn test_play_happy_path_then_stop() -> Result<()> {
    let mut harness = start_harness("").await?;
    harness.seed_device();

    let gb = harness.gb.clone();
    let play = tokio::spawn(async move {
        gb.play(&PlayInput {
            device_id: DEVICE_ID.to_string(),
            channel_id: CHANNEL_ID.to_string(),
        })
        .await
    });

    // the gateway offers SDP on the relay port with TCP passive setup
    let invite = match harness.sent().await {
        rsip::SipMessage::Request(req) => req,
        other => panic!("expected INVITE, got {}", other),
    };
    assert_eq!(invite.method, rsip::Method::Invite);
    let sdp = body_text(&invite);
    assert!(sdp.contains("m=video 30002 TCP/RTP/AVP 96 97 98\r\n"), "{}", sdp);
    assert!(sdp.contains("a=setup:passive\r\n"));
    assert!(sdp.contains("a=recvonly\r\n"));
    assert!(sdp.contains("s=Play\r\n"));
    let ssrc_line = sdp
        .lines()
        .find(|l| l.starts_with("y="))
        .expect("y= line");
    assert_eq!(ssrc_line.len(), 12);
    let subject = invite
        .headers
        .iter()
        .find_map(|h| match h {
            rsip::Header::Other(name, value) if name == "Subject" => Some(value.clone()),
            _ => None,
        })
        .expect("Subject header");
    assert_eq!(
        subject,
        format!("{}:ch123,{}:ch123", CHANNEL_ID, DEVICE_ID)
    );

    harness.inject(invite_ok(&invite).into());

    // ACK completes the dialog
    let ack = match harness.sent().await {
        rsip::SipMessage::Request(req) => req,
        other => panic!("expected ACK, got {}", other),
    };
    assert_eq!(ack.method, rsip::Method::Ack);

    let result = play.await.expect("join")?;
    assert_eq!(result.port, 30002);
    assert_eq!(result.stream_id, "ch123");
    assert_eq!(result.ssrc.len(), 10);
    assert!(result.ssrc.starts_with('0'));
    assert_eq!(harness.gb.sessions.len(), 1);

    // stop sends exactly one BYE with a bumped CSeq and drops the session
    harness.gb.stop_play(DEVICE_ID, CHANNEL_ID).await?;
    let bye = match harness.sent().await {
        rsip::SipMessage::Request(req) => req,
        other => panic!("expected BYE, got {}", other),
    };
    assert_eq!(bye.method, rsip::Method::Bye);
    let invite_cseq = invite.cseq_header()?.typed()?.seq;
    assert_eq!(bye.cseq_header()?.typed()?.seq, invite_cseq + 1);
    assert_eq!(
        bye.call_id_header()?.to_string(),
        invite.call_id_header()?.to_string()
    );
    assert_eq!(harness.gb.sessions.len(), 0);

    // stop again: idempotent, no second BYE
    harness.gb.stop_play(DEVICE_ID, CHANNEL_ID).await?;
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(200), harness.sent())
            .await
            .is_err(),
        "idempotent stop must not emit another BYE"
    );
    Ok(())
}

#[tokio::test]
async fn test_play_refused_when_offline() -> Result<()> {
    let harness = start_harness("").await?;
    harness.seed_device();
    harness
        .gb
        .registry
        .change(DEVICE_ID, |entry| entry.device.is_online = false)?;

    let err = harness
        .gb
        .play(&PlayInput {
            device_id: DEVICE_ID.to_string(),
            channel_id: CHANNEL_ID.to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeviceOffline(_)));
    assert_eq!(harness.gb.sessions.len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_play_unknown_channel() -> Result<()> {
    let harness = start_harness("").await?;
    harness.seed_device();
    let err = harness
        .gb
        .play(&PlayInput {
            device_id: DEVICE_ID.to_string(),
            channel_id: "34020000001310009999".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelNotExist(_)));
    Ok(())
}

#[tokio::test]
async fn test_replay_replaces_session() -> Result<()> {
    let mut harness = start_harness("").await?;
    harness.seed_device();

    for round in 0..2 {
        let gb = harness.gb.clone();
        let play = tokio::spawn(async move {
            gb.play(&PlayInput {
                device_id: DEVICE_ID.to_string(),
                channel_id: CHANNEL_ID.to_string(),
            })
            .await
        });

        loop {
            match harness.sent().await {
                rsip::SipMessage::Request(req) if req.method == rsip::Method::Invite => {
                    harness.inject(invite_ok(&req).into());
                }
                rsip::SipMessage::Request(req) if req.method == rsip::Method::Ack => {
                    break;
                }
                // round two starts by tearing the old session down
                rsip::SipMessage::Request(req) if req.method == rsip::Method::Bye => {
                    assert_eq!(round, 1, "BYE only expected when replacing");
                }
                other => panic!("unexpected message: {}", other),
            }
        }
        play.await.expect("join")?;
        assert_eq!(harness.gb.sessions.len(), 1, "one session per channel key");
    }
    Ok(())
}

#[tokio::test]
async fn test_playback_with_scale_control() -> Result<()> {
    let mut harness = start_harness("").await?;
    harness.seed_device();

    let gb = harness.gb.clone();
    let playback = tokio::spawn(async move {
        gb.playback(&PlaybackInput {
            device_id: DEVICE_ID.to_string(),
            channel_id: CHANNEL_ID.to_string(),
            start: 1700000000,
            end: 1700003600,
        })
        .await
    });

    let invite = match harness.sent().await {
        rsip::SipMessage::Request(req) => req,
        other => panic!("expected INVITE, got {}", other),
    };
    let sdp = body_text(&invite);
    assert!(sdp.contains("s=Playback\r\n"));
    assert!(sdp.contains("t=1700000000 1700003600\r\n"));
    assert!(sdp.contains(&format!("u={}:0\r\n", CHANNEL_ID)));
    let ssrc_line = sdp.lines().find(|l| l.starts_with("y=")).expect("y=");
    assert!(ssrc_line.starts_with("y=1"), "playback SSRC type: {}", ssrc_line);

    harness.inject(invite_ok(&invite).into());
    let ack = harness.sent().await;
    assert!(matches!(ack, rsip::SipMessage::Request(ref r) if r.method == rsip::Method::Ack));
    playback.await.expect("join")?;

    harness
        .gb
        .playback_control(DEVICE_ID, CHANNEL_ID, PlaybackAction::Scale, 2.0)
        .await?;
    let info = match harness.sent().await {
        rsip::SipMessage::Request(req) => req,
        other => panic!("expected INFO, got {}", other),
    };
    assert_eq!(info.method, rsip::Method::Info);
    assert_eq!(
        body_text(&info),
        "PLAY RTSP/1.0\r\nCSeq:3\r\nScale: 2.0\r\n\r\n"
    );
    Ok(())
}

#[tokio::test]
async fn test_device_bye_drops_session() -> Result<()> {
    let mut harness = start_harness("").await?;
    harness.seed_device();

    let gb = harness.gb.clone();
    let play = tokio::spawn(async move {
        gb.play(&PlayInput {
            device_id: DEVICE_ID.to_string(),
            channel_id: CHANNEL_ID.to_string(),
        })
        .await
    });
    let invite = match harness.sent().await {
        rsip::SipMessage::Request(req) => req,
        other => panic!("expected INVITE, got {}", other),
    };
    harness.inject(invite_ok(&invite).into());
    harness.sent().await; // ACK
    play.await.expect("join")?;
    assert_eq!(harness.gb.sessions.len(), 1);

    // the camera ends the dialog itself
    let bye = super::device_request(
        rsip::Method::Bye,
        "z9hG4bKdevbye",
        20,
        vec![],
        None,
    );
    // reuse the dialog's Call-ID so the session matches
    let call_id = invite.call_id_header()?.clone();
    let mut bye = bye;
    bye.headers.retain(|h| !matches!(h, rsip::Header::CallId(_)));
    bye.headers.push(rsip::Header::CallId(call_id));
    harness.inject(bye.into());

    let resp = match harness.sent().await {
        rsip::SipMessage::Response(resp) => resp,
        other => panic!("expected 200 to BYE, got {}", other),
    };
    assert_eq!(resp.status_code, rsip::StatusCode::OK);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while harness.gb.sessions.len() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "session not dropped");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    Ok(())
}
