//! Typed client for the ZLMediaKit-compatible media relay REST API.
//!
//! Every operation is a JSON POST to `/index/api/<op>`; responses carry a
//! `code`/`msg` envelope where `code=0` means success. Non-zero codes map
//! to `Error::Upstream`. Calls are not retried here; the one retrying case
//! (`addStreamProxy`) delegates retries to the relay itself via
//! `retry_count`.

use crate::config::MediaConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const DEFAULT_VHOST: &str = "__defaultVhost__";
const RTP_APP: &str = "rtp";

pub struct MediaClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiStatus {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenRtpServerResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct IsRecordingResponse {
    pub code: i64,
    #[serde(default)]
    pub status: bool,
}

#[derive(Debug, Deserialize)]
pub struct StreamProxyResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Option<StreamProxyKey>,
}

#[derive(Debug, Deserialize)]
pub struct StreamProxyKey {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct Mp4RecordFileResponse {
    pub code: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct MediaListResponse {
    pub code: i64,
    #[serde(default)]
    pub data: Vec<MediaListItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaListItem {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default, rename = "readerCount")]
    pub reader_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddStreamProxyRequest {
    pub app: String,
    pub stream: String,
    pub url: String,
    /// 0 UDP, 1 TCP.
    pub rtp_type: u8,
    pub retry_count: i32,
    pub timeout_sec: u32,
}

impl MediaClient {
    pub fn new(cfg: &MediaConfig) -> Self {
        MediaClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            base_url: format!("http://{}:{}", cfg.ip, cfg.http_port),
            secret: cfg.secret.clone(),
        }
    }

    /// For tests against a stub relay.
    pub fn with_base_url(base_url: &str, secret: &str) -> Self {
        MediaClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        op: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/index/api/{}?secret={}", self.base_url, op, self.secret);
        debug!(op = op, "media relay call");
        let resp = self.http.post(&url).json(&params).send().await?;
        Ok(resp.json::<T>().await?)
    }

    fn check(code: i64, msg: &str) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::Upstream {
                code,
                msg: msg.to_string(),
            })
        }
    }

    /// Open an RTP receive endpoint for `stream_id`; the relay picks the
    /// port. `tcp_mode`: 0 UDP, 1 TCP passive, 2 TCP active.
    pub async fn open_rtp_server(
        &self,
        stream_id: &str,
        tcp_mode: u8,
    ) -> Result<OpenRtpServerResponse> {
        let resp: OpenRtpServerResponse = self
            .post(
                "openRtpServer",
                json!({
                    "port": 0,
                    "tcp_mode": tcp_mode,
                    "stream_id": stream_id,
                }),
            )
            .await?;
        Self::check(resp.code, &resp.msg)?;
        Ok(resp)
    }

    pub async fn close_rtp_server(&self, stream_id: &str) -> Result<()> {
        let resp: ApiStatus = self
            .post("closeRtpServer", json!({ "stream_id": stream_id }))
            .await?;
        Self::check(resp.code, &resp.msg)
    }

    pub async fn start_record(&self, stream: &str) -> Result<()> {
        let resp: ApiStatus = self
            .post(
                "startRecord",
                json!({
                    "type": 1,
                    "vhost": DEFAULT_VHOST,
                    "app": RTP_APP,
                    "stream": stream,
                }),
            )
            .await?;
        Self::check(resp.code, &resp.msg)
    }

    pub async fn stop_record(&self, stream: &str) -> Result<()> {
        let resp: ApiStatus = self
            .post(
                "stopRecord",
                json!({
                    "type": 1,
                    "vhost": DEFAULT_VHOST,
                    "app": RTP_APP,
                    "stream": stream,
                }),
            )
            .await?;
        Self::check(resp.code, &resp.msg)
    }

    pub async fn is_recording(&self, stream: &str) -> Result<bool> {
        let resp: IsRecordingResponse = self
            .post(
                "isRecording",
                json!({
                    "type": 1,
                    "vhost": DEFAULT_VHOST,
                    "app": RTP_APP,
                    "stream": stream,
                }),
            )
            .await?;
        Self::check(resp.code, "isRecording failed")?;
        Ok(resp.status)
    }

    pub async fn get_mp4_record_file(
        &self,
        stream: &str,
        period: &str,
    ) -> Result<serde_json::Value> {
        let resp: Mp4RecordFileResponse = self
            .post(
                "getMp4RecordFile",
                json!({
                    "vhost": DEFAULT_VHOST,
                    "app": RTP_APP,
                    "stream": stream,
                    "period": period,
                }),
            )
            .await?;
        Self::check(resp.code, "getMp4RecordFile failed")?;
        Ok(resp.data)
    }

    /// Point the relay at an RTSP source; the relay owns the retry loop.
    pub async fn add_stream_proxy(&self, req: &AddStreamProxyRequest) -> Result<String> {
        let resp: StreamProxyResponse = self
            .post(
                "addStreamProxy",
                json!({
                    "vhost": DEFAULT_VHOST,
                    "app": req.app,
                    "stream": req.stream,
                    "url": req.url,
                    "rtp_type": req.rtp_type,
                    "retry_count": req.retry_count,
                    "timeout_sec": req.timeout_sec,
                    "enable_hls": true,
                    "enable_rtsp": true,
                    "enable_rtmp": true,
                    "enable_audio": true,
                    "auto_close": true,
                }),
            )
            .await?;
        Self::check(resp.code, &resp.msg)?;
        Ok(resp.data.map(|d| d.key).unwrap_or_default())
    }

    pub async fn get_media_list(&self) -> Result<Vec<MediaListItem>> {
        let resp: MediaListResponse = self.post("getMediaList", json!({})).await?;
        Self::check(resp.code, "getMediaList failed")?;
        Ok(resp.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_mapping() {
        assert!(MediaClient::check(0, "success").is_ok());
        let err = MediaClient::check(-300, "no such stream").unwrap_err();
        match err {
            Error::Upstream { code, msg } => {
                assert_eq!(code, -300);
                assert_eq!(msg, "no such stream");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_response_parsing() {
        let open: OpenRtpServerResponse =
            serde_json::from_str(r#"{"code":0,"port":30002}"#).unwrap();
        assert_eq!(open.port, 30002);

        let proxy: StreamProxyResponse =
            serde_json::from_str(r#"{"code":0,"data":{"key":"__defaultVhost__/proxy/sp1"}}"#)
                .unwrap();
        assert_eq!(proxy.data.unwrap().key, "__defaultVhost__/proxy/sp1");
    }
}
