//! Uniform protocol surface the REST façade drives.
//!
//! GB28181 and ONVIF devices behave very differently (SIP registration vs
//! SOAP polling, RTP push vs RTSP pull); this trait hides that behind five
//! operations.

use crate::gb::{Channel, Device, GbServerRef, PlayInput};
use crate::Result;
use async_trait::async_trait;

/// What a successful `start_play` hands back: a GB28181 push carries the
/// SSRC and relay stream id, an ONVIF pull carries the RTSP source URL.
#[derive(Debug, Clone, Default)]
pub struct PlayResponse {
    pub ssrc: String,
    pub stream: String,
    pub rtsp: String,
}

#[async_trait]
pub trait Protocol: Send + Sync {
    /// Probe device reachability before it is persisted.
    async fn validate_device(&self, device: &Device) -> Result<()>;
    /// Post-creation setup, e.g. enumerate ONVIF profiles into channels.
    async fn init_device(&self, device: &Device) -> Result<()>;
    async fn query_catalog(&self, device: &Device) -> Result<()>;
    async fn start_play(&self, device: &Device, channel: &Channel) -> Result<PlayResponse>;
    async fn stop_play(&self, device: &Device, channel: &Channel) -> Result<()>;
}

pub struct Gb28181Protocol {
    server: GbServerRef,
}

impl Gb28181Protocol {
    pub fn new(server: GbServerRef) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Protocol for Gb28181Protocol {
    async fn validate_device(&self, _device: &Device) -> Result<()> {
        // a GB device proves itself by registering
        Ok(())
    }

    async fn init_device(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    async fn query_catalog(&self, device: &Device) -> Result<()> {
        self.server.query_catalog(&device.device_id).await
    }

    async fn start_play(&self, device: &Device, channel: &Channel) -> Result<PlayResponse> {
        let result = self
            .server
            .play(&PlayInput {
                device_id: device.device_id.clone(),
                channel_id: channel.channel_id.clone(),
            })
            .await?;
        Ok(PlayResponse {
            ssrc: result.ssrc,
            stream: result.stream_id,
            rtsp: String::new(),
        })
    }

    async fn stop_play(&self, device: &Device, channel: &Channel) -> Result<()> {
        self.server
            .stop_play(&device.device_id, &channel.channel_id)
            .await
    }
}
