use super::xml::CatalogItem;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Idle window after which a partial catalog is flushed anyway.
pub const CATALOG_IDLE_FLUSH: Duration = Duration::from_secs(10);

struct Accumulator {
    sum: usize,
    items: Vec<CatalogItem>,
    last_at: Instant,
}

/// Accumulates catalog responses.
///
/// Devices split a catalog over several MESSAGEs, each repeating `SumNum`
/// and carrying a slice of the item list. Chunks are collected per
/// `(device_id, SN)` until the declared total arrives; a flusher drains
/// batches that went idle without completing.
#[derive(Default)]
pub struct CatalogIngester {
    pending: DashMap<(String, u32), Accumulator>,
}

impl Default for Accumulator {
    fn default() -> Self {
        Accumulator {
            sum: 0,
            items: Vec::new(),
            last_at: Instant::now(),
        }
    }
}

impl CatalogIngester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one response chunk. Returns the full item list once
    /// `∑items >= SumNum`.
    pub fn ingest(
        &self,
        device_id: &str,
        sn: u32,
        sum_num: usize,
        items: Vec<CatalogItem>,
    ) -> Option<Vec<CatalogItem>> {
        let key = (device_id.to_string(), sn);
        let mut entry = self.pending.entry(key.clone()).or_default();
        entry.sum = sum_num;
        entry.items.extend(items);
        entry.last_at = Instant::now();
        let complete = entry.sum > 0 && entry.items.len() >= entry.sum;
        drop(entry);

        if complete {
            self.pending.remove(&key).map(|(_, acc)| acc.items)
        } else {
            None
        }
    }

    /// Remove and return batches idle for longer than `idle`.
    pub fn drain_idle(&self, idle: Duration) -> Vec<(String, Vec<CatalogItem>)> {
        let now = Instant::now();
        let expired: Vec<_> = self
            .pending
            .iter()
            .filter(|e| now.duration_since(e.last_at) >= idle)
            .map(|e| e.key().clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                self.pending
                    .remove(&key)
                    .map(|(k, acc)| (k.0, acc.items))
            })
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
