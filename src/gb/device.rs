use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Persistable device row.
///
/// `device_id` is the 20-digit GB28181 identifier; `id` is the gateway's
/// opaque internal id (`gb…` / `on…`). ONVIF devices reuse the same row with
/// ip/port/credentials filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    /// Wire transport the device registered over: "udp" or "tcp".
    pub transport: String,
    /// RTP push mode: 0 UDP, 1 TCP passive, 2 TCP active.
    pub stream_mode: u8,
    /// Last seen source address, host:port.
    pub address: String,
    pub keepalive_at: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
    pub expires: u32,
    pub is_online: bool,
    /// Channel count from the last catalog flush.
    pub channels: usize,
    // ONVIF fields
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Device {
    pub fn new(id: &str, device_id: &str) -> Self {
        Device {
            id: id.to_string(),
            device_id: device_id.to_string(),
            transport: "udp".to_string(),
            ..Default::default()
        }
    }
}

/// Persistable channel row. Identity is `(device_id, channel_id)`; for
/// ONVIF, `channel_id` holds the media profile token. `did` refers to the
/// parent device's internal id; a row whose `did` matches no device is
/// stale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub did: String,
    pub device_id: String,
    pub channel_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub status: String,
    pub is_online: bool,
    pub is_playing: bool,
}

impl Channel {
    pub fn new(device_id: &str, channel_id: &str) -> Self {
        Channel {
            device_id: device_id.to_string(),
            channel_id: channel_id.to_string(),
            ..Default::default()
        }
    }
}

/// Runtime view of a registered device: the row plus transport state and
/// the per-device mutex serialising all session operations.
#[derive(Clone)]
pub struct DeviceEntry {
    pub device: Device,
    pub source: Option<SipAddr>,
    pub connection: Option<SipConnection>,
    pub play_mutex: Arc<Mutex<()>>,
}

impl DeviceEntry {
    pub fn new(device: Device) -> Self {
        DeviceEntry {
            device,
            source: None,
            connection: None,
            play_mutex: Arc::new(Mutex::new(())),
        }
    }
}

/// In-memory registry of active devices and channels.
///
/// Devices are never removed by protocol activity, only by administrative
/// delete. All mutation goes through `change`, which runs the mutator under
/// the owning shard's write lock; `load` hands out a snapshot.
#[derive(Default)]
pub struct Registry {
    devices: DashMap<String, DeviceEntry>,
    channels: DashMap<(String, String), Channel>,
    by_internal: DashMap<String, (String, String)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, device_id: &str) -> Option<DeviceEntry> {
        self.devices.get(device_id).map(|e| e.clone())
    }

    pub fn store(&self, entry: DeviceEntry) {
        self.devices
            .insert(entry.device.device_id.clone(), entry);
    }

    pub fn delete(&self, device_id: &str) -> Option<DeviceEntry> {
        let removed = self.devices.remove(device_id).map(|(_, e)| e);
        let keys: Vec<_> = self
            .channels
            .iter()
            .filter(|c| c.device_id == device_id)
            .map(|c| c.key().clone())
            .collect();
        for key in keys {
            if let Some((_, channel)) = self.channels.remove(&key) {
                self.by_internal.remove(&channel.id);
            }
        }
        removed
    }

    /// Mutate a device in place under the shard lock; readers observe either
    /// the old or the new state, never a torn one.
    pub fn change<F>(&self, device_id: &str, mutator: F) -> Result<DeviceEntry>
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let mut entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotExist(device_id.to_string()))?;
        mutator(entry.value_mut());
        Ok(entry.clone())
    }

    /// Lookup-or-insert used by REGISTER handling.
    pub fn load_or_store<F>(&self, device_id: &str, init: F) -> DeviceEntry
    where
        F: FnOnce() -> DeviceEntry,
    {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(init)
            .clone()
    }

    pub fn get_channel(&self, device_id: &str, channel_id: &str) -> Option<Channel> {
        self.channels
            .get(&(device_id.to_string(), channel_id.to_string()))
            .map(|c| c.clone())
    }

    pub fn store_channel(&self, channel: Channel) {
        if !channel.id.is_empty() {
            self.by_internal.insert(
                channel.id.clone(),
                (channel.device_id.clone(), channel.channel_id.clone()),
            );
        }
        self.channels.insert(
            (channel.device_id.clone(), channel.channel_id.clone()),
            channel,
        );
    }

    pub fn channels_of(&self, device_id: &str) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|c| c.device_id == device_id)
            .map(|c| c.clone())
            .collect()
    }

    /// Resolve a relay stream id (channel internal id) back to its channel.
    pub fn channel_by_internal_id(&self, id: &str) -> Option<Channel> {
        let key = self.by_internal.get(id)?.clone();
        self.channels.get(&key).map(|c| c.clone())
    }

    pub fn online_count(&self) -> usize {
        self.devices.iter().filter(|e| e.device.is_online).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn test_store_load_roundtrip() {
        let registry = Registry::new();
        let mut device = Device::new("gb0001", "34020000001320000001");
        device.name = "front gate".to_string();
        device.stream_mode = 2;
        registry.store(DeviceEntry::new(device));

        let loaded = registry.load("34020000001320000001").expect("loaded");
        assert_eq!(loaded.device.name, "front gate");
        assert_eq!(loaded.device.stream_mode, 2);
        assert!(registry.load("34020000001320000009").is_none());
    }

    #[test]
    fn test_change_is_published_whole() {
        let registry = Registry::new();
        registry.store(DeviceEntry::new(Device::new("gb0001", "dev")));
        registry
            .change("dev", |entry| {
                entry.device.name = "renamed".to_string();
                entry.device.is_online = true;
            })
            .expect("change");
        let loaded = registry.load("dev").unwrap();
        assert_eq!(loaded.device.name, "renamed");
        assert!(loaded.device.is_online);

        let missing = registry.change("nope", |_| {});
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_change_no_torn_state() {
        let registry = StdArc::new(Registry::new());
        registry.store(DeviceEntry::new(Device::new("gb0001", "dev")));

        // writers flip name and manufacturer together; readers must never
        // observe them disagreeing
        let mut tasks = Vec::new();
        for i in 0..8u32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let tag = format!("v{}", i);
                    let tag2 = tag.clone();
                    registry
                        .change("dev", move |entry| {
                            entry.device.name = tag.clone();
                            entry.device.manufacturer = tag2.clone();
                        })
                        .unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..400 {
                    let snapshot = registry.load("dev").unwrap();
                    assert_eq!(snapshot.device.name, snapshot.device.manufacturer);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[test]
    fn test_channel_index() {
        let registry = Registry::new();
        registry.store(DeviceEntry::new(Device::new("gb0001", "dev")));
        let mut channel = Channel::new("dev", "ch-a");
        channel.id = "ch000001".to_string();
        registry.store_channel(channel);

        assert!(registry.get_channel("dev", "ch-a").is_some());
        let by_internal = registry.channel_by_internal_id("ch000001").unwrap();
        assert_eq!(by_internal.channel_id, "ch-a");
        assert_eq!(registry.channels_of("dev").len(), 1);

        registry.delete("dev");
        assert!(registry.get_channel("dev", "ch-a").is_none());
        assert!(registry.channel_by_internal_id("ch000001").is_none());
    }
}
