//! The reading cache: the latest readings for each device, keyed by device
//! ID. The scheduler publishes batches onto the read channel; a single
//! updater task drains the channel into the cache, so the cache has
//! one-writer/many-readers semantics. RPC reads see a consistent snapshot of
//! a single device's latest poll.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::reading::{DeviceReadings, Reading};

/// The latest readings per device.
#[derive(Clone, Default)]
pub struct ReadingCache {
    inner: Arc<RwLock<HashMap<String, Vec<Reading>>>>,
}

impl ReadingCache {
    /// Returns a new, empty cache.
    pub fn new() -> Self {
        ReadingCache::default()
    }

    /// The latest readings for a device, or `None` if the device has never
    /// been read.
    pub async fn get(&self, device_id: &str) -> Option<Vec<Reading>> {
        self.inner.read().await.get(device_id).cloned()
    }

    /// Replaces the cached readings for the batch's device. The cache keeps
    /// latest values only, not a history.
    pub(crate) async fn update(&self, batch: DeviceReadings) {
        self.inner
            .write()
            .await
            .insert(batch.device_id, batch.readings);
    }

    /// Drains the read channel into the cache until the channel closes.
    pub(crate) async fn run_updater(self, mut readings: mpsc::Receiver<DeviceReadings>) {
        while let Some(batch) = readings.recv().await {
            self.update(batch).await;
        }
        debug!("reading cache updater stopped");
    }
}
