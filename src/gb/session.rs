use super::device::DeviceEntry;
use super::server::{GbServer, CONTENT_TYPE_MANSRTSP, CONTENT_TYPE_SDP, INVITE_TIMEOUT};
use crate::transaction::wait_final_response;
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::{Header, Method};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Stream kind, also the first SSRC digit: 0 live, 1 playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Play,
    Playback,
}

impl SessionKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            SessionKind::Play => "play",
            SessionKind::Playback => "playback",
        }
    }

    fn ssrc_type(&self) -> u8 {
        match self {
            SessionKind::Play => 0,
            SessionKind::Playback => 1,
        }
    }

    fn session_name(&self) -> &'static str {
        match self {
            SessionKind::Play => "Play",
            SessionKind::Playback => "Playback",
        }
    }
}

pub fn session_key(kind: SessionKind, device_id: &str, channel_id: &str) -> String {
    format!("{}:{}:{}", kind.prefix(), device_id, channel_id)
}

/// One established (or in-flight) INVITE dialog toward a camera. The stored
/// 2xx supplies everything later in-dialog requests need: To-tag, Contact,
/// Call-ID and the CSeq base.
#[derive(Clone)]
pub struct StreamSession {
    pub key: String,
    pub kind: SessionKind,
    pub device_id: String,
    pub channel_id: String,
    pub stream_id: String,
    pub ssrc: String,
    pub response: Option<rsip::Response>,
}

/// 10-digit ASCII SSRC: `<type><domain-tail-4><counter-5>`, counter
/// monotonic modulo 100000.
pub struct SsrcAllocator {
    domain_tail: String,
    counter: AtomicU32,
}

impl SsrcAllocator {
    pub fn new(domain: &str) -> Self {
        let tail: String = domain
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let domain_tail = format!("{:0>4}", tail);
        SsrcAllocator {
            domain_tail,
            counter: AtomicU32::new(0),
        }
    }

    pub fn allocate(&self, kind: SessionKind) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) % 100_000;
        format!("{}{}{:05}", kind.ssrc_type(), self.domain_tail, n)
    }
}

pub struct PlayInput {
    pub device_id: String,
    pub channel_id: String,
}

pub struct PlaybackInput {
    pub device_id: String,
    pub channel_id: String,
    /// Unix seconds.
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone)]
pub struct PlayResult {
    pub ssrc: String,
    pub stream_id: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackAction {
    Play,
    Pause,
    Scale,
}

pub(crate) struct SdpParams<'a> {
    pub name: &'a str,
    pub channel_id: &'a str,
    pub ip: &'a str,
    pub port: u16,
    pub stream_mode: u8,
    pub ssrc: &'a str,
    pub start: i64,
    pub end: i64,
    pub uri: Option<String>,
}

/// SDP offer for a GB28181 push: video-only, PS/MPEG4/H264 payloads,
/// recvonly, `y=` SSRC line, `setup`/`connection` attributes in TCP modes.
pub(crate) fn build_sdp(p: &SdpParams) -> String {
    let proto = if p.stream_mode == 0 {
        "RTP/AVP"
    } else {
        "TCP/RTP/AVP"
    };
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o={} 0 0 IN IP4 {}\r\n", p.channel_id, p.ip));
    sdp.push_str(&format!("s={}\r\n", p.name));
    if let Some(uri) = &p.uri {
        sdp.push_str(&format!("u={}\r\n", uri));
    }
    sdp.push_str(&format!("c=IN IP4 {}\r\n", p.ip));
    sdp.push_str(&format!("t={} {}\r\n", p.start, p.end));
    sdp.push_str(&format!("m=video {} {} 96 97 98\r\n", p.port, proto));
    sdp.push_str("a=recvonly\r\n");
    match p.stream_mode {
        1 => {
            sdp.push_str("a=setup:passive\r\n");
            sdp.push_str("a=connection:new\r\n");
        }
        2 => {
            sdp.push_str("a=setup:active\r\n");
            sdp.push_str("a=connection:new\r\n");
        }
        _ => {}
    }
    sdp.push_str("a=rtpmap:96 PS/90000\r\n");
    sdp.push_str("a=rtpmap:97 MPEG4/90000\r\n");
    sdp.push_str("a=rtpmap:98 H264/90000\r\n");
    sdp.push_str(&format!("y={}\r\n", p.ssrc));
    sdp
}

/// Resolve the configured SDP address to a dotted IPv4 literal. Domain
/// names are looked up, preferring A records.
pub(crate) async fn resolve_media_ip(input: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::DnsResolution("empty SDP address".to_string()));
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4.to_string()),
            IpAddr::V6(_) => Err(Error::DnsResolution(format!(
                "IPv6 SDP address not supported: {}",
                input
            ))),
        };
    }
    let addrs: Vec<_> = tokio::net::lookup_host((input, 0))
        .await
        .map_err(|e| Error::DnsResolution(format!("{}: {}", input, e)))?
        .collect();
    for addr in &addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            return Ok(v4.to_string());
        }
    }
    match addrs.first() {
        Some(addr) => Ok(addr.ip().to_string()),
        None => Err(Error::DnsResolution(format!("no address for {}", input))),
    }
}

impl GbServer {
    /// Start a live stream for a channel. Serialised per device by the
    /// play mutex; an existing session on the key is stopped first.
    pub async fn play(&self, input: &PlayInput) -> Result<PlayResult> {
        let channel = self
            .registry
            .get_channel(&input.device_id, &input.channel_id)
            .ok_or_else(|| {
                Error::ChannelNotExist(format!("{}:{}", input.device_id, input.channel_id))
            })?;
        let device = self
            .registry
            .load(&input.device_id)
            .ok_or_else(|| Error::DeviceNotExist(input.device_id.to_string()))?;

        let _guard = device.play_mutex.clone().lock_owned().await;

        if !device.device.is_online {
            return Err(Error::DeviceOffline(input.device_id.to_string()));
        }

        let key = session_key(SessionKind::Play, &input.device_id, &input.channel_id);
        if self.sessions.contains_key(&key) {
            debug!(key = %key, "replacing existing play session");
            if let Err(e) = self.stop_session(&key, &device).await {
                warn!("stop before replay failed: {}", e);
            }
        }

        let stream_id = channel.id.clone();
        if stream_id.is_empty() {
            return Err(Error::Internal(format!(
                "channel {} has no internal id",
                input.channel_id
            )));
        }
        let ssrc = self.ssrc.allocate(SessionKind::Play);
        self.sessions.insert(
            key.clone(),
            StreamSession {
                key: key.clone(),
                kind: SessionKind::Play,
                device_id: input.device_id.clone(),
                channel_id: input.channel_id.clone(),
                stream_id: stream_id.clone(),
                ssrc: ssrc.clone(),
                response: None,
            },
        );

        let result = self
            .invite_for_stream(
                &device,
                &channel.channel_id,
                &stream_id,
                &ssrc,
                SessionKind::Play,
                0,
                0,
            )
            .await;

        match result {
            Ok((response, port)) => {
                if let Some(mut session) = self.sessions.get_mut(&key) {
                    session.response = Some(response);
                }
                info!(key = %key, ssrc = %ssrc, port = port, "play established");
                Ok(PlayResult {
                    ssrc,
                    stream_id,
                    port,
                })
            }
            Err(e) => {
                self.sessions.remove(&key);
                Err(e)
            }
        }
    }

    /// Stop a live stream. Idempotent and best-effort for offline devices.
    pub async fn stop_play(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let device = self
            .registry
            .load(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;
        let _guard = device.play_mutex.clone().lock_owned().await;
        let key = session_key(SessionKind::Play, device_id, channel_id);
        self.stop_session(&key, &device).await
    }

    /// Start a recorded-footage stream over `[start, end]`.
    pub async fn playback(&self, input: &PlaybackInput) -> Result<PlayResult> {
        let channel = self
            .registry
            .get_channel(&input.device_id, &input.channel_id)
            .ok_or_else(|| {
                Error::ChannelNotExist(format!("{}:{}", input.device_id, input.channel_id))
            })?;
        let device = self
            .registry
            .load(&input.device_id)
            .ok_or_else(|| Error::DeviceNotExist(input.device_id.to_string()))?;

        let _guard = device.play_mutex.clone().lock_owned().await;

        if !device.device.is_online {
            return Err(Error::DeviceOffline(input.device_id.to_string()));
        }

        let key = session_key(SessionKind::Playback, &input.device_id, &input.channel_id);
        if self.sessions.contains_key(&key) {
            debug!(key = %key, "replacing existing playback session");
            if let Err(e) = self.stop_session(&key, &device).await {
                warn!("stop before replay failed: {}", e);
            }
        }

        let stream_id = format!("playback_{}_{}", channel.id, input.start);
        let ssrc = self.ssrc.allocate(SessionKind::Playback);
        self.sessions.insert(
            key.clone(),
            StreamSession {
                key: key.clone(),
                kind: SessionKind::Playback,
                device_id: input.device_id.clone(),
                channel_id: input.channel_id.clone(),
                stream_id: stream_id.clone(),
                ssrc: ssrc.clone(),
                response: None,
            },
        );

        let result = self
            .invite_for_stream(
                &device,
                &channel.channel_id,
                &stream_id,
                &ssrc,
                SessionKind::Playback,
                input.start,
                input.end,
            )
            .await;

        match result {
            Ok((response, port)) => {
                if let Some(mut session) = self.sessions.get_mut(&key) {
                    session.response = Some(response);
                }
                info!(key = %key, ssrc = %ssrc, port = port, "playback established");
                Ok(PlayResult {
                    ssrc,
                    stream_id,
                    port,
                })
            }
            Err(e) => {
                self.sessions.remove(&key);
                Err(e)
            }
        }
    }

    pub async fn stop_playback(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let device = self
            .registry
            .load(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;
        let _guard = device.play_mutex.clone().lock_owned().await;
        let key = session_key(SessionKind::Playback, device_id, channel_id);
        self.stop_session(&key, &device).await
    }

    /// In-dialog trick-play control: RTSP mini-headers in an INFO body.
    pub async fn playback_control(
        &self,
        device_id: &str,
        channel_id: &str,
        action: PlaybackAction,
        scale: f64,
    ) -> Result<()> {
        let device = self
            .registry
            .load(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;
        let key = session_key(SessionKind::Playback, device_id, channel_id);
        let response = self
            .sessions
            .get(&key)
            .and_then(|s| s.response.clone())
            .ok_or_else(|| Error::BadRequest(format!("no playback session on {}", key)))?;

        let body = match action {
            PlaybackAction::Pause => "PAUSE RTSP/1.0\r\nCSeq:1\r\n\r\n".to_string(),
            PlaybackAction::Play => "PLAY RTSP/1.0\r\nCSeq:2\r\n\r\n".to_string(),
            PlaybackAction::Scale => {
                format!("PLAY RTSP/1.0\r\nCSeq:3\r\nScale: {:.1}\r\n\r\n", scale)
            }
        };

        let mut request = self.request_from_response(Method::Info, &response, true)?;
        request.headers.retain(|h| !matches!(h, Header::ContentLength(_)));
        request
            .headers
            .push(Header::ContentType(CONTENT_TYPE_MANSRTSP.into()));
        request
            .headers
            .push(Header::ContentLength((body.len() as u32).into()));
        request.body = body.into_bytes();

        let mut tx = self.endpoint.client_transaction(request)?;
        tx.destination = device.source.clone();
        tx.connection = device.connection.clone();
        tx.send().await
    }

    /// Find the session a BYE from the device refers to, by Call-ID.
    pub(crate) fn session_by_call_id(&self, call_id: &str) -> Option<StreamSession> {
        self.sessions
            .iter()
            .find(|s| {
                s.response
                    .as_ref()
                    .and_then(|r| r.call_id_header().ok())
                    .map(|c| c.to_string() == call_id)
                    .unwrap_or(false)
            })
            .map(|s| s.clone())
    }

    pub(crate) fn remove_session(&self, key: &str) -> Option<StreamSession> {
        self.sessions.remove(key).map(|(_, s)| s)
    }

    /// Tear down a session: drop the record, then fire a best-effort BYE
    /// built from the stored 2xx. Waiting for the answer is the camera's
    /// problem.
    pub(crate) async fn stop_session(&self, key: &str, device: &DeviceEntry) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(key) else {
            return Ok(());
        };
        let Some(response) = session.response else {
            return Ok(());
        };

        let bye = self.request_from_response(Method::Bye, &response, true)?;
        let mut tx = self.endpoint.client_transaction(bye)?;
        tx.destination = device.source.clone();
        tx.connection = device.connection.clone();
        tx.send().await?;
        debug!(key = %key, "BYE sent");
        Ok(())
    }

    /// Allocate the relay port, offer SDP, INVITE, wait, ACK. Returns the
    /// (possibly Contact-patched) 2xx plus the receive port.
    async fn invite_for_stream(
        &self,
        device: &DeviceEntry,
        channel_id: &str,
        stream_id: &str,
        ssrc: &str,
        kind: SessionKind,
        start: i64,
        end: i64,
    ) -> Result<(rsip::Response, u16)> {
        let stream_mode = device.device.stream_mode;
        let open = self
            .zlm
            .open_rtp_server(stream_id, stream_mode)
            .await?;

        let ip = resolve_media_ip(&self.media_cfg.sdp_ip).await?;
        let sdp = build_sdp(&SdpParams {
            name: kind.session_name(),
            channel_id,
            ip: &ip,
            port: open.port,
            stream_mode,
            ssrc,
            start,
            end,
            uri: match kind {
                SessionKind::Playback => Some(format!("{}:0", channel_id)),
                SessionKind::Play => None,
            },
        });

        let subject = format!(
            "{}:{},{}:{}",
            channel_id, stream_id, device.device.device_id, stream_id
        );
        let mut tx = self.device_request(
            channel_id,
            device,
            Method::Invite,
            Some(CONTENT_TYPE_SDP),
            sdp.into_bytes(),
            vec![Header::Other("Subject".to_string(), subject)],
        )?;
        tx.send().await?;

        let response = match tokio::time::timeout(INVITE_TIMEOUT, wait_final_response(&mut tx)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.zlm.close_rtp_server(stream_id).await.ok();
                return Err(e);
            }
            Err(_) => {
                // deadline beat the transaction; a 2xx that already arrived
                // must still be acknowledged or the camera keeps the dialog
                if let Some(late) = tx.last_response().cloned() {
                    if late.status_code.kind() == rsip::StatusCodeKind::Successful {
                        if let Ok(ack) = self.request_from_response(Method::Ack, &late, false) {
                            tx.send_ack(ack).await.ok();
                        }
                    }
                }
                self.zlm.close_rtp_server(stream_id).await.ok();
                return Err(Error::Timeout(format!("INVITE to {}", channel_id)));
            }
        };

        if response.status_code.kind() != rsip::StatusCodeKind::Successful {
            self.zlm.close_rtp_server(stream_id).await.ok();
            return Err(Error::Error(format!(
                "INVITE rejected by {}: {}",
                channel_id, response.status_code
            )));
        }

        let response = self.ensure_contact(response)?;
        let ack = self.request_from_response(Method::Ack, &response, false)?;
        tx.send_ack(ack).await?;
        Ok((response, open.port))
    }

    /// Some cameras answer 200 without a Contact; synthesize one from the
    /// server identity so the BYE has a request URI.
    fn ensure_contact(&self, mut response: rsip::Response) -> Result<rsip::Response> {
        if response.contact_header().is_err() {
            response.headers.push(
                rsip::typed::Contact {
                    display_name: None,
                    uri: self.server_uri()?,
                    params: vec![],
                }
                .into(),
            );
        }
        Ok(response)
    }
}
