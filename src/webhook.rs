//! Webhook surface consumed by the media relay.
//!
//! The relay treats non-zero replies as failures and retries some hooks, so
//! reconciliation errors are logged and swallowed; every hook answers
//! `{code:0}` except a rejected publish and `on_stream_none_reader`, which
//! additionally asks the relay to close the idle stream.

use crate::gb::{GbServerRef, PlayInput};
use crate::store::Storer;
use crate::zlm::{AddStreamProxyRequest, MediaClient};
use crate::{bz, gb::device::Registry};
use axum::{extract::State, routing::post, Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

pub struct WebhookState {
    pub gb: GbServerRef,
    pub zlm: Arc<MediaClient>,
    pub store: Arc<dyn Storer>,
    pub registry: Arc<Registry>,
    pub rtmp_secret: String,
    /// Unix seconds of the relay's last keepalive.
    pub relay_seen_at: AtomicI64,
    /// RTSP pull proxies by stream id, managed administratively.
    pub proxies: DashMap<String, StreamProxy>,
}

#[derive(Debug, Clone)]
pub struct StreamProxy {
    pub app: String,
    pub stream: String,
    pub source_url: String,
    /// 0 UDP, 1 TCP.
    pub transport: u8,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook/on_server_keepalive", post(on_server_keepalive))
        .route("/webhook/on_publish", post(on_publish))
        .route("/webhook/on_play", post(on_play))
        .route("/webhook/on_stream_changed", post(on_stream_changed))
        .route("/webhook/on_stream_none_reader", post(on_stream_none_reader))
        .route("/webhook/on_stream_not_found", post(on_stream_not_found))
        .route("/webhook/on_rtp_server_timeout", post(on_rtp_server_timeout))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct DefaultOutput {
    pub code: i32,
    pub msg: String,
}

impl DefaultOutput {
    pub fn ok() -> Self {
        DefaultOutput {
            code: 0,
            msg: "success".to_string(),
        }
    }

    fn reject(msg: String) -> Self {
        DefaultOutput { code: 1, msg }
    }
}

#[derive(Debug, Serialize)]
pub struct NoneReaderOutput {
    pub code: i32,
    pub close: bool,
}

#[derive(Debug, Deserialize)]
pub struct ServerKeepaliveInput {
    #[serde(default, rename = "mediaServerId")]
    pub media_server_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishInput {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub params: String,
    #[serde(default, rename = "mediaServerId")]
    pub media_server_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamChangedInput {
    #[serde(default)]
    pub regist: bool,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default, rename = "mediaServerId")]
    pub media_server_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamNoneReaderInput {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default, rename = "mediaServerId")]
    pub media_server_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamNotFoundInput {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default, rename = "mediaServerId")]
    pub media_server_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RtpServerTimeoutInput {
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub ssrc: u32,
    #[serde(default)]
    pub stream_id: String,
    #[serde(default, rename = "mediaServerId")]
    pub media_server_id: String,
}

pub(crate) fn query_param<'a>(params: &'a str, key: &str) -> Option<&'a str> {
    params.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// RTMP publish signature: `sign` must equal md5(secret).
pub(crate) fn publish_sign_ok(secret: &str, params: &str) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Some(sign) = query_param(params, "sign") else {
        return false;
    };
    let expected = format!("{:x}", md5::compute(secret.as_bytes()));
    expected.eq_ignore_ascii_case(sign)
}

pub async fn on_server_keepalive(
    State(state): State<Arc<WebhookState>>,
    Json(input): Json<ServerKeepaliveInput>,
) -> Json<DefaultOutput> {
    debug!(media_server_id = %input.media_server_id, "relay keepalive");
    state
        .relay_seen_at
        .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    Json(DefaultOutput::ok())
}

pub async fn on_publish(
    State(state): State<Arc<WebhookState>>,
    Json(input): Json<PublishInput>,
) -> Json<DefaultOutput> {
    info!(app = %input.app, stream = %input.stream, schema = %input.schema, "webhook on_publish");
    if input.schema == "rtmp" && !publish_sign_ok(&state.rtmp_secret, &input.params) {
        return Json(DefaultOutput::reject("sign mismatch".to_string()));
    }
    Json(DefaultOutput::ok())
}

pub async fn on_play(
    State(_state): State<Arc<WebhookState>>,
    Json(input): Json<PublishInput>,
) -> Json<DefaultOutput> {
    debug!(app = %input.app, stream = %input.stream, "webhook on_play");
    Json(DefaultOutput::ok())
}

pub async fn on_stream_changed(
    State(state): State<Arc<WebhookState>>,
    Json(input): Json<StreamChangedInput>,
) -> Json<DefaultOutput> {
    info!(
        app = %input.app,
        stream = %input.stream,
        schema = %input.schema,
        regist = input.regist,
        "webhook on_stream_changed"
    );
    // rtmp is the first schema the relay registers and unregisters; keying
    // on it keeps the hook single-shot per stream
    if input.app == "rtp" && input.schema == "rtmp" && !input.regist {
        match lookup_channel(&state, &input.stream).await {
            Some(channel) => {
                if let Err(e) = state.gb.stop_play(&channel.device_id, &channel.channel_id).await
                {
                    warn!("stream_changed teardown failed: {}", e);
                }
            }
            None => debug!(stream = %input.stream, "stream_changed for unknown channel"),
        }
    }
    Json(DefaultOutput::ok())
}

pub async fn on_stream_none_reader(
    State(state): State<Arc<WebhookState>>,
    Json(input): Json<StreamNoneReaderInput>,
) -> Json<NoneReaderOutput> {
    info!(app = %input.app, stream = %input.stream, "webhook on_stream_none_reader");
    if input.app == "rtp" && bz::is_gb28181(&input.stream) {
        if let Some(channel) = lookup_channel(&state, &input.stream).await {
            if let Err(e) = state.gb.stop_play(&channel.device_id, &channel.channel_id).await {
                warn!("none_reader teardown failed: {}", e);
            }
        }
    }
    Json(NoneReaderOutput {
        code: 0,
        close: true,
    })
}

pub async fn on_stream_not_found(
    State(state): State<Arc<WebhookState>>,
    Json(input): Json<StreamNotFoundInput>,
) -> Json<DefaultOutput> {
    info!(
        app = %input.app,
        stream = %input.stream,
        schema = %input.schema,
        "webhook on_stream_not_found"
    );
    if input.app == "rtp" {
        // the relay fires once per schema; act on rtmp only
        if input.schema == "rtmp" {
            if let Err(e) = replay_gb_stream(&state, &input.stream).await {
                warn!("stream_not_found replay failed: {}", e);
            }
        }
    } else if bz::is_rtsp(&input.stream) {
        if let Err(e) = replay_rtsp_proxy(&state, &input.stream).await {
            warn!("stream_not_found proxy failed: {}", e);
        }
    }
    Json(DefaultOutput::ok())
}

pub async fn on_rtp_server_timeout(
    State(_state): State<Arc<WebhookState>>,
    Json(input): Json<RtpServerTimeoutInput>,
) -> Json<DefaultOutput> {
    info!(
        stream_id = %input.stream_id,
        local_port = input.local_port,
        ssrc = input.ssrc,
        "webhook on_rtp_server_timeout"
    );
    Json(DefaultOutput::ok())
}

async fn lookup_channel(
    state: &WebhookState,
    stream: &str,
) -> Option<crate::gb::device::Channel> {
    if let Some(channel) = state.registry.channel_by_internal_id(stream) {
        return Some(channel);
    }
    state.store.channel().get_by_id(stream).await.ok()
}

async fn replay_gb_stream(state: &WebhookState, stream: &str) -> crate::Result<()> {
    let channel = lookup_channel(state, stream)
        .await
        .ok_or_else(|| crate::Error::ChannelNotExist(stream.to_string()))?;
    state
        .gb
        .play(&PlayInput {
            device_id: channel.device_id.clone(),
            channel_id: channel.channel_id.clone(),
        })
        .await
        .map(|_| ())
}

async fn replay_rtsp_proxy(state: &WebhookState, stream: &str) -> crate::Result<()> {
    let proxy = state
        .proxies
        .get(stream)
        .map(|p| p.clone())
        .ok_or_else(|| crate::Error::ChannelNotExist(format!("proxy {}", stream)))?;
    let key = state
        .zlm
        .add_stream_proxy(&AddStreamProxyRequest {
            app: proxy.app.clone(),
            stream: proxy.stream.clone(),
            url: proxy.source_url.clone(),
            rtp_type: proxy.transport,
            retry_count: 3,
            timeout_sec: 10,
        })
        .await?;
    info!(stream = %stream, key = %key, "stream proxy re-added");
    Ok(())
}
