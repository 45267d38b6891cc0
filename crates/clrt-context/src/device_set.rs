//! The fixed set of devices a context owns.

use tracing::debug;

use crate::device::DeviceRef;

/// Devices owned by one context, plus the orderings derived from them.
///
/// The set never changes after construction. Holding a [`DeviceRef`] keeps
/// each device retained; dropping the set releases them.
#[derive(Debug, Clone)]
pub struct DeviceSet {
    devices: Vec<DeviceRef>,
    svm_devices: Vec<DeviceRef>,
    custom_host_alloc: Option<DeviceRef>,
}

impl DeviceSet {
    pub fn new(devices: Vec<DeviceRef>) -> Self {
        let custom_host_alloc = devices.iter().find(|d| d.custom_host_allocator()).cloned();
        let mut svm_devices: Vec<DeviceRef> =
            devices.iter().filter(|d| d.svm_support()).cloned().collect();
        order_svm_devices(&mut svm_devices);

        debug!(
            devices = devices.len(),
            svm_devices = svm_devices.len(),
            custom_host_alloc = custom_host_alloc.is_some(),
            "device set built"
        );
        Self {
            devices,
            svm_devices,
            custom_host_alloc,
        }
    }

    /// Every device, in the order the client supplied them.
    pub fn devices(&self) -> &[DeviceRef] {
        &self.devices
    }

    /// SVM-capable devices in allocation order.
    pub fn svm_devices(&self) -> &[DeviceRef] {
        &self.svm_devices
    }

    /// The first device offering a custom host allocator, if any.
    pub fn custom_host_alloc_device(&self) -> Option<&DeviceRef> {
        self.custom_host_alloc.as_ref()
    }

    pub fn contains(&self, device: &DeviceRef) -> bool {
        self.devices.iter().any(|d| d == device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Put a fine-grained-system incapable device first so the strictest
/// coherency requirement is satisfied before any mirror is created.
/// A single swap; the rest of the order is left as supplied.
fn order_svm_devices(svm_devices: &mut [DeviceRef]) {
    if svm_devices.len() < 2 || !svm_devices[0].is_fine_grained_system() {
        return;
    }
    if let Some(pos) = svm_devices.iter().position(|d| !d.is_fine_grained_system()) {
        svm_devices.swap(0, pos);
    }
}
