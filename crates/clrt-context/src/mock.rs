//! In-memory [`Device`] for tests and host-only builds.
//!
//! `MockDevice` hands out fake addresses, never touches real memory, and
//! records every call so tests can assert on fan-out order and counts.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{Device, DeviceInfo, MemorySegment, SvmCapabilities, SvmMemFlags, SvmPtr};
use crate::properties::{ContextFlags, ExternalHandle, HandleTable};

static NEXT_BASE: AtomicUsize = AtomicUsize::new(1);

const ADDRESS_SPACE_STRIDE: usize = 1 << 32;
const ALLOCATION_STRIDE: usize = 1 << 16;

/// Shared, ordered record of device calls across several mock devices.
#[derive(Debug, Default, Clone)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: String) {
        lock(&self.0).push(event);
    }

    /// Snapshot of every recorded event, oldest first.
    pub fn events(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Events whose text ends with `suffix` (e.g. `":svm_alloc"`).
    pub fn matching(&self, suffix: &str) -> Vec<String> {
        let events = self.events();
        events
            .into_iter()
            .filter(|e| e.ends_with(suffix))
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builder for [`MockDevice`].
#[derive(Debug)]
pub struct MockDeviceBuilder {
    info: DeviceInfo,
    custom_host_allocator: bool,
    fail_svm_alloc: bool,
    fail_bind: bool,
    log: Option<EventLog>,
}

impl MockDeviceBuilder {
    pub fn svm(mut self, caps: SvmCapabilities) -> Self {
        self.info.svm_capabilities = caps;
        self
    }

    pub fn max_on_device_queues(mut self, max: u32) -> Self {
        self.info.max_on_device_queues = max;
        self
    }

    pub fn custom_host_allocator(mut self) -> Self {
        self.custom_host_allocator = true;
        self
    }

    pub fn fail_svm_alloc(mut self) -> Self {
        self.fail_svm_alloc = true;
        self
    }

    pub fn fail_bind(mut self) -> Self {
        self.fail_bind = true;
        self
    }

    pub fn log(mut self, log: &EventLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn build(self) -> MockDevice {
        let slot = NEXT_BASE.fetch_add(1, Ordering::Relaxed);
        MockDevice {
            info: self.info,
            custom_host_allocator: self.custom_host_allocator,
            base_addr: slot * ADDRESS_SPACE_STRIDE,
            fail_svm_alloc: AtomicBool::new(self.fail_svm_alloc),
            fail_bind: AtomicBool::new(self.fail_bind),
            next_alloc: AtomicUsize::new(1),
            counters: Counters::default(),
            live_svm: Mutex::new(Vec::new()),
            log: self.log,
        }
    }

    pub fn build_arc(self) -> Arc<MockDevice> {
        Arc::new(self.build())
    }
}

#[derive(Debug, Default)]
struct Counters {
    bind: AtomicUsize,
    unbind: AtomicUsize,
    destroy: AtomicUsize,
    svm_alloc: AtomicUsize,
    svm_free: AtomicUsize,
    host_alloc: AtomicUsize,
    host_free: AtomicUsize,
}

/// A scriptable device that records how it was used.
#[derive(Debug)]
pub struct MockDevice {
    info: DeviceInfo,
    custom_host_allocator: bool,
    base_addr: usize,
    fail_svm_alloc: AtomicBool,
    fail_bind: AtomicBool,
    next_alloc: AtomicUsize,
    counters: Counters,
    live_svm: Mutex<Vec<SvmPtr>>,
    log: Option<EventLog>,
}

impl MockDevice {
    pub fn builder(name: &str) -> MockDeviceBuilder {
        MockDeviceBuilder {
            info: DeviceInfo {
                name: name.to_string(),
                ..Default::default()
            },
            custom_host_allocator: false,
            fail_svm_alloc: false,
            fail_bind: false,
            log: None,
        }
    }

    fn record(&self, op: &str) {
        if let Some(log) = &self.log {
            log.push(format!("{}:{op}", self.info.name));
        }
    }

    /// Toggle SVM allocation failure after construction.
    pub fn set_fail_svm_alloc(&self, fail: bool) {
        self.fail_svm_alloc.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }

    pub fn bind_calls(&self) -> usize {
        self.counters.bind.load(Ordering::SeqCst)
    }

    pub fn unbind_calls(&self) -> usize {
        self.counters.unbind.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.counters.destroy.load(Ordering::SeqCst)
    }

    pub fn svm_alloc_calls(&self) -> usize {
        self.counters.svm_alloc.load(Ordering::SeqCst)
    }

    pub fn svm_free_calls(&self) -> usize {
        self.counters.svm_free.load(Ordering::SeqCst)
    }

    pub fn host_alloc_calls(&self) -> usize {
        self.counters.host_alloc.load(Ordering::SeqCst)
    }

    pub fn host_free_calls(&self) -> usize {
        self.counters.host_free.load(Ordering::SeqCst)
    }

    /// SVM regions currently allocated on this device.
    pub fn live_svm(&self) -> Vec<SvmPtr> {
        lock(&self.live_svm).clone()
    }

    fn fresh_addr(&self, alignment: usize) -> usize {
        let n = self.next_alloc.fetch_add(1, Ordering::SeqCst);
        let addr = self.base_addr + n * ALLOCATION_STRIDE;
        match alignment {
            0 | 1 => addr,
            a => addr.next_multiple_of(a),
        }
    }
}

impl Device for MockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn custom_host_allocator(&self) -> bool {
        self.custom_host_allocator
    }

    fn svm_alloc(
        &self,
        _size: usize,
        alignment: usize,
        _flags: SvmMemFlags,
        hint: Option<SvmPtr>,
    ) -> Option<SvmPtr> {
        self.counters.svm_alloc.fetch_add(1, Ordering::SeqCst);
        self.record("svm_alloc");
        if self.fail_svm_alloc.load(Ordering::SeqCst) {
            return None;
        }
        let ptr = match hint {
            Some(hint) => hint,
            None => SvmPtr::from_addr(self.fresh_addr(alignment))?,
        };
        lock(&self.live_svm).push(ptr);
        Some(ptr)
    }

    fn svm_free(&self, ptr: SvmPtr) {
        self.counters.svm_free.fetch_add(1, Ordering::SeqCst);
        self.record("svm_free");
        lock(&self.live_svm).retain(|p| *p != ptr);
    }

    fn host_alloc(
        &self,
        _size: usize,
        alignment: usize,
        segment: MemorySegment,
    ) -> Option<NonNull<u8>> {
        self.counters.host_alloc.fetch_add(1, Ordering::SeqCst);
        self.record(match segment {
            MemorySegment::Atomics => "host_alloc_atomics",
            MemorySegment::NoAtomics => "host_alloc",
        });
        if !self.custom_host_allocator {
            return None;
        }
        let addr = self.fresh_addr(alignment);
        NonNull::new(std::ptr::without_provenance_mut(addr))
    }

    fn host_free(&self, _ptr: NonNull<u8>) {
        self.counters.host_free.fetch_add(1, Ordering::SeqCst);
        self.record("host_free");
    }

    fn bind_external_device(
        &self,
        _flags: ContextFlags,
        _handles: &HandleTable,
        _gl_context: ExternalHandle,
        _validate_only: bool,
    ) -> bool {
        self.counters.bind.fetch_add(1, Ordering::SeqCst);
        self.record("bind");
        !self.fail_bind.load(Ordering::SeqCst)
    }

    fn unbind_external_device(
        &self,
        _flags: ContextFlags,
        _handles: &HandleTable,
        _gl_context: ExternalHandle,
        _validate_only: bool,
    ) {
        self.counters.unbind.fetch_add(1, Ordering::SeqCst);
        self.record("unbind");
    }

    fn context_destroy(&self) {
        self.counters.destroy.fetch_add(1, Ordering::SeqCst);
        self.record("destroy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_is_mirrored() {
        let dev = MockDevice::builder("gpu")
            .svm(SvmCapabilities::COARSE_GRAIN_BUFFER)
            .build();
        let first = dev
            .svm_alloc(64, 256, SvmMemFlags::READ_WRITE, None)
            .unwrap();
        assert_eq!(first.addr() % 256, 0);
        let again = dev
            .svm_alloc(64, 256, SvmMemFlags::READ_WRITE, Some(first))
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(dev.svm_alloc_calls(), 2);
    }

    #[test]
    fn scripted_failures() {
        let dev = MockDevice::builder("gpu")
            .fail_svm_alloc()
            .fail_bind()
            .build();
        assert!(dev.svm_alloc(64, 0, SvmMemFlags::empty(), None).is_none());
        let bound = dev.bind_external_device(
            ContextFlags::GL_DEVICE_KHR,
            &HandleTable::default(),
            ExternalHandle::NULL,
            false,
        );
        assert!(!bound);
        dev.set_fail_svm_alloc(false);
        assert!(dev.svm_alloc(64, 0, SvmMemFlags::empty(), None).is_some());
    }

    #[test]
    fn distinct_devices_use_distinct_addresses() {
        let a = MockDevice::builder("a").build();
        let b = MockDevice::builder("b").build();
        let pa = a.svm_alloc(1, 0, SvmMemFlags::empty(), None).unwrap();
        let pb = b.svm_alloc(1, 0, SvmMemFlags::empty(), None).unwrap();
        assert_ne!(pa, pb);
    }

    #[test]
    fn log_records_in_order() {
        let log = EventLog::new();
        let a = MockDevice::builder("a").log(&log).build();
        let b = MockDevice::builder("b").log(&log).build();
        b.context_destroy();
        a.context_destroy();
        assert_eq!(log.events(), vec!["b:destroy", "a:destroy"]);
        assert_eq!(log.matching(":destroy").len(), 2);
    }
}
