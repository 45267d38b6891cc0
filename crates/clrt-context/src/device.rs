//! Compute device collaborator interface.
//!
//! The driver behind a device (command submission, physical allocation,
//! interop handshakes) lives outside this crate. A context only needs the
//! capability queries and per-device hooks declared by [`Device`], and holds
//! devices through [`DeviceRef`], a shared handle that keeps the device alive
//! for as long as any context references it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::properties::{ContextFlags, ExternalHandle, HandleTable};

bitflags! {
    /// Shared virtual memory capabilities reported by a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SvmCapabilities: u32 {
        const COARSE_GRAIN_BUFFER = 1 << 0;
        const FINE_GRAIN_BUFFER = 1 << 1;
        const FINE_GRAIN_SYSTEM = 1 << 2;
        const ATOMICS = 1 << 3;
    }
}

bitflags! {
    /// Flags accepted by an SVM allocation request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SvmMemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const FINE_GRAIN_BUFFER = 1 << 10;
        /// Platform atomics: the region must support atomics visible system-wide.
        const ATOMICS = 1 << 11;
    }
}

/// Static capability information for a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub name: String,
    pub svm_capabilities: SvmCapabilities,
    /// Upper bound on live on-device queues for one context.
    pub max_on_device_queues: u32,
}

/// Host memory segment requested from a custom host allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySegment {
    Atomics,
    NoAtomics,
}

impl MemorySegment {
    pub fn for_atomics(atomics: bool) -> Self {
        if atomics {
            Self::Atomics
        } else {
            Self::NoAtomics
        }
    }
}

/// Address of a shared virtual memory region, valid on every SVM device of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SvmPtr(NonZeroUsize);

impl SvmPtr {
    /// Wrap a raw address. The null address yields `None`.
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for SvmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// A compute device as seen by a context.
///
/// Implementations are shared between contexts and must tolerate calls from
/// any thread. Allocation hooks report failure with `None` instead of an error
/// value: the caller decides what a failed allocation means.
pub trait Device: Send + Sync + fmt::Debug {
    /// Capability information.
    fn info(&self) -> &DeviceInfo;

    /// Whether the device can take part in shared virtual memory allocations.
    fn svm_support(&self) -> bool {
        !self.info().svm_capabilities.is_empty()
    }

    /// Whether the device's coherency model covers arbitrary system allocations.
    fn is_fine_grained_system(&self) -> bool {
        let caps = self.info().svm_capabilities;
        caps.contains(SvmCapabilities::FINE_GRAIN_SYSTEM)
    }

    /// Whether the device supports platform-wide SVM atomics.
    fn supports_svm_atomics(&self) -> bool {
        let caps = self.info().svm_capabilities;
        caps.contains(SvmCapabilities::ATOMICS)
    }

    /// Whether host allocations for the context should be routed to this device.
    fn custom_host_allocator(&self) -> bool {
        false
    }

    /// Allocate an SVM region. `hint` carries an address already produced on
    /// another device so the region can be mirrored at the same address.
    fn svm_alloc(
        &self,
        size: usize,
        alignment: usize,
        flags: SvmMemFlags,
        hint: Option<SvmPtr>,
    ) -> Option<SvmPtr>;

    /// Free an SVM region previously produced by [`Device::svm_alloc`].
    fn svm_free(&self, ptr: SvmPtr);

    /// Allocate host memory through the device's allocator.
    fn host_alloc(
        &self,
        _size: usize,
        _alignment: usize,
        _segment: MemorySegment,
    ) -> Option<NonNull<u8>> {
        None
    }

    /// Free host memory produced by [`Device::host_alloc`].
    fn host_free(&self, _ptr: NonNull<u8>) {}

    /// Associate the device with the external graphics/3D device in `handles`.
    fn bind_external_device(
        &self,
        flags: ContextFlags,
        handles: &HandleTable,
        gl_context: ExternalHandle,
        validate_only: bool,
    ) -> bool;

    /// Undo [`Device::bind_external_device`].
    fn unbind_external_device(
        &self,
        flags: ContextFlags,
        handles: &HandleTable,
        gl_context: ExternalHandle,
        validate_only: bool,
    );

    /// Notification that a context holding this device is being destroyed.
    fn context_destroy(&self);
}

/// Identity of a device, stable for as long as the device is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(usize);

/// Shared handle to a device. Cloning retains, dropping releases.
#[derive(Clone)]
pub struct DeviceRef(Arc<dyn Device>);

impl DeviceRef {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self(device)
    }

    /// Identity used for per-device bookkeeping.
    pub fn key(&self) -> DeviceKey {
        DeviceKey(Arc::as_ptr(&self.0) as *const () as usize)
    }

    /// Number of live handles to the underlying device.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<D: Device + 'static> From<Arc<D>> for DeviceRef {
    fn from(device: Arc<D>) -> Self {
        Self(device)
    }
}

impl Deref for DeviceRef {
    type Target = dyn Device;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for DeviceRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DeviceRef {}

impl Hash for DeviceRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRef")
            .field("name", &self.info().name)
            .field("key", &self.key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn svm_ptr_rejects_null() {
        assert!(SvmPtr::from_addr(0).is_none());
        assert_eq!(SvmPtr::from_addr(0x1000).unwrap().addr(), 0x1000);
        assert_eq!(SvmPtr::from_addr(0x1000).unwrap().to_string(), "0x1000");
    }

    #[test]
    fn capability_defaults_follow_info() {
        let caps = SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::ATOMICS;
        let dev = MockDevice::builder("gpu").svm(caps).build();
        assert!(dev.svm_support());
        assert!(!dev.is_fine_grained_system());
        assert!(dev.supports_svm_atomics());

        let plain = MockDevice::builder("cpu").build();
        assert!(!plain.svm_support());
    }

    #[test]
    fn device_ref_identity_and_refcount() {
        let dev = Arc::new(MockDevice::builder("gpu").build());
        let a = DeviceRef::from(dev.clone());
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(Arc::strong_count(&dev), 3);
        drop(b);
        assert_eq!(a.ref_count(), 2);

        let other = DeviceRef::from(Arc::new(MockDevice::builder("gpu").build()));
        assert_ne!(a, other);
    }

    #[test]
    fn memory_segment_from_flag() {
        assert_eq!(MemorySegment::for_atomics(true), MemorySegment::Atomics);
        assert_eq!(MemorySegment::for_atomics(false), MemorySegment::NoAtomics);
    }
}
