//! Repository interfaces for persisted device/channel rows.
//!
//! The registry (`gb::device`) is authoritative for runtime state; these
//! traits are authoritative for persistent fields. Production deployments
//! back them with the relational store, `MemoryStore` backs tests and the
//! default wiring.

use crate::gb::device::{Channel, Device};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;

pub type Mutator<T> = Box<dyn FnOnce(&mut T) + Send>;

/// A unit of work applied through `Storer::session`. Real repositories run
/// it inside a database transaction.
pub type SessionFn = Box<dyn for<'a> FnOnce(&'a dyn Storer) -> BoxFuture<'a, Result<()>> + Send>;

#[async_trait]
pub trait DeviceStorer: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<Device>;
    async fn find(&self) -> Result<Vec<Device>>;
    async fn add(&self, device: &Device) -> Result<()>;
    /// Load, apply the mutator, write back atomically.
    async fn edit(&self, device_id: &str, mutator: Mutator<Device>) -> Result<Device>;
    async fn del(&self, device_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ChannelStorer: Send + Sync {
    async fn get(&self, device_id: &str, channel_id: &str) -> Result<Channel>;
    /// Lookup by the opaque internal id; this is how relay webhooks find
    /// their channel.
    async fn get_by_id(&self, id: &str) -> Result<Channel>;
    async fn find(&self, device_id: &str) -> Result<Vec<Channel>>;
    async fn add(&self, channel: &Channel) -> Result<()>;
    async fn edit(
        &self,
        device_id: &str,
        channel_id: &str,
        mutator: Mutator<Channel>,
    ) -> Result<Channel>;
    async fn del(&self, device_id: &str, channel_id: &str) -> Result<()>;
}

#[async_trait]
pub trait Storer: Send + Sync {
    fn device(&self) -> &dyn DeviceStorer;
    fn channel(&self) -> &dyn ChannelStorer;
    async fn session(&self, work: SessionFn) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    devices: DashMap<String, Device>,
    channels: DashMap<(String, String), Channel>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStorer for MemoryStore {
    async fn get(&self, device_id: &str) -> Result<Device> {
        if device_id.is_empty() {
            return Err(Error::BadRequest("empty device id".to_string()));
        }
        self.devices
            .get(device_id)
            .map(|d| d.clone())
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))
    }

    async fn find(&self) -> Result<Vec<Device>> {
        Ok(self.devices.iter().map(|d| d.clone()).collect())
    }

    async fn add(&self, device: &Device) -> Result<()> {
        self.devices
            .insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn edit(&self, device_id: &str, mutator: Mutator<Device>) -> Result<Device> {
        let mut entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;
        mutator(entry.value_mut());
        Ok(entry.clone())
    }

    async fn del(&self, device_id: &str) -> Result<()> {
        self.devices.remove(device_id);
        Ok(())
    }
}

#[async_trait]
impl ChannelStorer for MemoryStore {
    async fn get(&self, device_id: &str, channel_id: &str) -> Result<Channel> {
        if device_id.is_empty() && channel_id.is_empty() {
            return Err(Error::BadRequest("empty channel query".to_string()));
        }
        self.channels
            .get(&(device_id.to_string(), channel_id.to_string()))
            .map(|c| c.clone())
            .ok_or_else(|| Error::ChannelNotExist(format!("{}:{}", device_id, channel_id)))
    }

    async fn get_by_id(&self, id: &str) -> Result<Channel> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.clone())
            .ok_or_else(|| Error::ChannelNotExist(id.to_string()))
    }

    async fn find(&self, device_id: &str) -> Result<Vec<Channel>> {
        Ok(self
            .channels
            .iter()
            .filter(|c| c.device_id == device_id)
            .map(|c| c.clone())
            .collect())
    }

    async fn add(&self, channel: &Channel) -> Result<()> {
        self.channels.insert(
            (channel.device_id.clone(), channel.channel_id.clone()),
            channel.clone(),
        );
        Ok(())
    }

    async fn edit(
        &self,
        device_id: &str,
        channel_id: &str,
        mutator: Mutator<Channel>,
    ) -> Result<Channel> {
        let mut entry = self
            .channels
            .get_mut(&(device_id.to_string(), channel_id.to_string()))
            .ok_or_else(|| Error::ChannelNotExist(format!("{}:{}", device_id, channel_id)))?;
        mutator(entry.value_mut());
        Ok(entry.clone())
    }

    async fn del(&self, device_id: &str, channel_id: &str) -> Result<()> {
        self.channels
            .remove(&(device_id.to_string(), channel_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Storer for MemoryStore {
    fn device(&self) -> &dyn DeviceStorer {
        self
    }

    fn channel(&self) -> &dyn ChannelStorer {
        self
    }

    async fn session(&self, work: SessionFn) -> Result<()> {
        // no transactional isolation in memory; callers get atomicity from
        // the real repository
        work(self).await
    }
}
