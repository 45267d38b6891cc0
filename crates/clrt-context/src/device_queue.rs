//! Per-device on-device queue bookkeeping.
//!
//! The registry counts queues and tracks each device's default queue. It does
//! no locking: mutation takes `&mut self`, so callers serialize queue
//! creation themselves.

use std::collections::HashMap;

use crate::device::{DeviceKey, DeviceRef};

/// Opaque identity of an on-device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u64);

/// Queue accounting for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceQueueInfo {
    pub count: u32,
    pub default_queue: Option<QueueId>,
}

#[derive(Debug, Default)]
pub struct DeviceQueueRegistry {
    entries: HashMap<DeviceKey, DeviceQueueInfo>,
}

impl DeviceQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another on-device queue fits under the device's limit.
    pub fn can_add_queue(&self, device: &DeviceRef) -> bool {
        let count = self.entries.get(&device.key()).map_or(0, |e| e.count);
        count < device.info().max_on_device_queues
    }

    /// Record a new queue. Does not check [`Self::can_add_queue`].
    pub fn add(&mut self, device: &DeviceRef, queue: QueueId, is_default: bool) {
        let entry = self.entries.entry(device.key()).or_default();
        entry.count += 1;
        if is_default {
            entry.default_queue = Some(queue);
        }
    }

    /// Forget a queue.
    ///
    /// # Panics
    ///
    /// Panics if the device has no live queues.
    pub fn remove(&mut self, device: &DeviceRef, queue: QueueId) {
        let entry = self.entries.entry(device.key()).or_default();
        assert!(
            entry.count != 0,
            "removing queue {queue:?} from device '{}' with no live queues",
            device.info().name
        );
        entry.count -= 1;
        if entry.default_queue == Some(queue) {
            entry.default_queue = None;
        }
    }

    pub fn default_queue(&self, device: &DeviceRef) -> Option<QueueId> {
        self.entries
            .get(&device.key())
            .and_then(|e| e.default_queue)
    }

    pub fn info(&self, device: &DeviceRef) -> Option<DeviceQueueInfo> {
        self.entries.get(&device.key()).copied()
    }
}
