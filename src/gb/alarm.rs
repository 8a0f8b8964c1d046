use super::server::GbServer;
use super::xml;
use crate::transaction::random_sn;
use crate::{Error, Result};
use rsip::Header;
use tracing::info;

// Alarm priorities, GB/T 28181 A.2.5
pub const ALARM_PRIORITY_LOW: &str = "1";
pub const ALARM_PRIORITY_MEDIUM: &str = "2";
pub const ALARM_PRIORITY_HIGH: &str = "3";
pub const ALARM_PRIORITY_CRITICAL: &str = "4";

// Alarm methods
pub const ALARM_METHOD_DEVICE: &str = "1";
pub const ALARM_METHOD_ZONE: &str = "2";
pub const ALARM_METHOD_VIDEO: &str = "5";
pub const ALARM_METHOD_OTHER: &str = "6";

impl GbServer {
    /// Subscribe to a device's alarm notifications. `expires` of zero
    /// cancels the subscription. The responses themselves arrive as Notify
    /// MESSAGEs and fan out on the broadcast channel.
    pub async fn alarm_subscribe(&self, device_id: &str, expires: u32) -> Result<()> {
        let entry = self
            .registry
            .load(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;

        let body = xml::AlarmQuery::new(random_sn(), device_id).to_xml()?;
        let response = self
            .message_request(
                device_id,
                &entry,
                body,
                vec![
                    Header::Other("Event".to_string(), "presence".to_string()),
                    Header::Expires(expires.into()),
                ],
            )
            .await?;

        if response.status_code.kind() != rsip::StatusCodeKind::Successful {
            return Err(Error::Error(format!(
                "alarm subscribe rejected: {}",
                response.status_code
            )));
        }
        info!(device_id = %device_id, expires = expires, "alarm subscription updated");
        Ok(())
    }

    pub async fn alarm_unsubscribe(&self, device_id: &str) -> Result<()> {
        self.alarm_subscribe(device_id, 0).await
    }
}
