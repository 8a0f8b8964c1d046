use super::xml::RecordItem;
use crate::{Error, Result};
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// How long a record-info caller blocks for the device to finish answering.
pub const RECORD_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

struct Waiter {
    sum: usize,
    items: Vec<RecordItem>,
    notify: Option<oneshot::Sender<Vec<RecordItem>>>,
}

/// Correlates RecordInfo responses with their blocked caller by SN.
///
/// Accumulation follows the catalog scheme: chunks arrive with a repeated
/// `SumNum` until the total is reached, then the caller is released.
#[derive(Default)]
pub struct RecordWaiters {
    pending: DashMap<u32, Waiter>,
}

impl RecordWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in responses for `sn` before the query is sent.
    pub fn register(&self, sn: u32) -> oneshot::Receiver<Vec<RecordItem>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            sn,
            Waiter {
                sum: 0,
                items: Vec::new(),
                notify: Some(tx),
            },
        );
        rx
    }

    /// Feed a response chunk; releases the caller when complete.
    pub fn deliver(&self, sn: u32, sum_num: usize, items: Vec<RecordItem>) {
        let Some(mut waiter) = self.pending.get_mut(&sn) else {
            return;
        };
        waiter.sum = sum_num;
        waiter.items.extend(items);
        let complete = waiter.items.len() >= waiter.sum;
        if !complete {
            return;
        }
        let items = std::mem::take(&mut waiter.items);
        let notify = waiter.notify.take();
        drop(waiter);
        self.pending.remove(&sn);
        if let Some(notify) = notify {
            notify.send(items).ok();
        }
    }

    pub fn cancel(&self, sn: u32) {
        self.pending.remove(&sn);
    }

    /// Await completion, abandoning the waiter on timeout.
    pub async fn wait(
        &self,
        sn: u32,
        rx: oneshot::Receiver<Vec<RecordItem>>,
    ) -> Result<Vec<RecordItem>> {
        match tokio::time::timeout(RECORD_QUERY_TIMEOUT, rx).await {
            Ok(Ok(items)) => Ok(items),
            Ok(Err(_)) => {
                self.cancel(sn);
                Err(Error::Internal("record waiter dropped".to_string()))
            }
            Err(_) => {
                self.cancel(sn);
                Err(Error::Timeout(format!("record query sn={}", sn)))
            }
        }
    }
}

impl super::server::GbServer {
    /// Query a channel's recordings over `[start, end]` and block until the
    /// device has delivered every chunk or the window expires.
    pub async fn query_record_info(
        &self,
        device_id: &str,
        channel_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<RecordItem>> {
        let channel = self
            .registry
            .get_channel(device_id, channel_id)
            .ok_or_else(|| Error::ChannelNotExist(format!("{}:{}", device_id, channel_id)))?;
        let entry = self
            .registry
            .load(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;

        let sn = crate::transaction::random_sn();
        let rx = self.records.register(sn);
        let body = super::xml::RecordInfoQuery::new(sn, &channel.channel_id, start, end)
            .to_xml()?;
        if let Err(e) = self
            .message_request_no_wait(&channel.channel_id, &entry, body)
            .await
        {
            self.records.cancel(sn);
            return Err(e);
        }
        self.records.wait(sn, rx).await
    }
}
