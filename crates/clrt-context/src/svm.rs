//! Shared virtual memory allocation across every SVM device of a context.
//!
//! One logical region is mirrored on each participating device at the same
//! address: the first device picks the address and every later device is
//! handed that address as a hint. All allocations and frees for one context
//! are serialized by the coordinator's lock.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::config::SvmFailurePolicy;
use crate::device::{DeviceRef, SvmMemFlags, SvmPtr};

/// Serializes SVM fan-out for one context.
#[derive(Debug)]
pub struct SvmCoordinator {
    lock: Mutex<()>,
    policy: SvmFailurePolicy,
}

impl SvmCoordinator {
    pub fn new(policy: SvmFailurePolicy) -> Self {
        Self {
            lock: Mutex::new(()),
            policy,
        }
    }

    pub fn policy(&self) -> SvmFailurePolicy {
        self.policy
    }

    /// Allocate `size` bytes on every device in `devices` (allocation order).
    ///
    /// `preferred` is tried first when it can honor the request. Devices that
    /// cannot provide platform atomics are skipped when
    /// [`SvmMemFlags::ATOMICS`] is requested. Any device failure fails the
    /// whole request; what happens to regions already placed on earlier
    /// devices depends on the [`SvmFailurePolicy`].
    pub fn alloc(
        &self,
        devices: &[DeviceRef],
        size: usize,
        alignment: usize,
        flags: SvmMemFlags,
        preferred: Option<&DeviceRef>,
    ) -> Option<SvmPtr> {
        if devices.is_empty() {
            return None;
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let atomics = flags.contains(SvmMemFlags::ATOMICS);
        let mut placed: Vec<(&DeviceRef, SvmPtr)> = Vec::with_capacity(devices.len());
        let mut ptr: Option<SvmPtr> = None;

        if let Some(dev) = preferred {
            if !atomics || dev.supports_svm_atomics() {
                let Some(p) = dev.svm_alloc(size, alignment, flags, ptr) else {
                    warn!(device = %dev.info().name, size, "preferred SVM allocation failed");
                    return None;
                };
                ptr = Some(p);
                placed.push((dev, p));
            }
        }

        for dev in devices {
            if preferred.is_some_and(|p| p == dev) {
                continue;
            }
            if atomics && !dev.supports_svm_atomics() {
                debug!(device = %dev.info().name, "skipping device without SVM platform atomics");
                continue;
            }
            match dev.svm_alloc(size, alignment, flags, ptr) {
                Some(p) => {
                    ptr = Some(p);
                    placed.push((dev, p));
                }
                None => {
                    warn!(
                        device = %dev.info().name,
                        size,
                        placed = placed.len(),
                        policy = ?self.policy,
                        "SVM allocation failed"
                    );
                    self.unwind(&placed);
                    return None;
                }
            }
        }

        if let Some(p) = ptr {
            debug!(ptr = %p, size, devices = placed.len(), "SVM region allocated");
        }
        ptr
    }

    /// Free `ptr` on every device in `devices`.
    pub fn free(&self, devices: &[DeviceRef], ptr: SvmPtr) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        for dev in devices {
            dev.svm_free(ptr);
        }
        debug!(ptr = %ptr, devices = devices.len(), "SVM region freed");
    }

    fn unwind(&self, placed: &[(&DeviceRef, SvmPtr)]) {
        match self.policy {
            SvmFailurePolicy::Rollback => {
                for (dev, p) in placed.iter().rev() {
                    dev.svm_free(*p);
                }
            }
            SvmFailurePolicy::Leak => {
                if !placed.is_empty() {
                    warn!(devices = placed.len(), "keeping partial SVM allocation");
                }
            }
        }
    }
}

impl Default for SvmCoordinator {
    fn default() -> Self {
        Self::new(SvmFailurePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::SvmCapabilities;
    use crate::mock::{EventLog, MockDevice};

    fn svm_dev(name: &str, caps: SvmCapabilities, log: &EventLog) -> Arc<MockDevice> {
        MockDevice::builder(name).svm(caps).log(log).build_arc()
    }

    fn failing_dev(name: &str, log: &EventLog) -> Arc<MockDevice> {
        MockDevice::builder(name)
            .svm(CG)
            .fail_svm_alloc()
            .log(log)
            .build_arc()
    }

    const CG: SvmCapabilities = SvmCapabilities::COARSE_GRAIN_BUFFER;
    const RW: SvmMemFlags = SvmMemFlags::READ_WRITE;

    #[test]
    fn no_devices_returns_none() {
        let svm = SvmCoordinator::default();
        assert!(svm.alloc(&[], 4096, 256, RW, None).is_none());
    }

    #[test]
    fn mirrors_one_address_on_every_device() {
        let log = EventLog::new();
        let a = svm_dev("a", CG, &log);
        let b = svm_dev("b", CG, &log);
        let devices = [DeviceRef::from(a.clone()), DeviceRef::from(b.clone())];
        let svm = SvmCoordinator::default();

        let ptr = svm.alloc(&devices, 4096, 256, RW, None).unwrap();
        assert_eq!(a.live_svm(), vec![ptr]);
        assert_eq!(b.live_svm(), vec![ptr]);
        assert_eq!(log.matching(":svm_alloc"), ["a:svm_alloc", "b:svm_alloc"]);

        svm.free(&devices, ptr);
        assert!(a.live_svm().is_empty());
        assert!(b.live_svm().is_empty());
    }

    #[test]
    fn preferred_device_goes_first_and_once() {
        let log = EventLog::new();
        let a = svm_dev("a", CG, &log);
        let b = svm_dev("b", CG, &log);
        let devices = [DeviceRef::from(a.clone()), DeviceRef::from(b.clone())];
        let svm = SvmCoordinator::default();

        svm.alloc(&devices, 64, 0, RW, Some(&devices[1])).unwrap();
        assert_eq!(log.matching(":svm_alloc"), ["b:svm_alloc", "a:svm_alloc"]);
        assert_eq!(b.svm_alloc_calls(), 1);
    }

    #[test]
    fn preferred_without_atomics_is_skipped() {
        let log = EventLog::new();
        let plain = svm_dev("plain", CG, &log);
        let atomic = svm_dev("atomic", CG | SvmCapabilities::ATOMICS, &log);
        let devices = [
            DeviceRef::from(plain.clone()),
            DeviceRef::from(atomic.clone()),
        ];
        let svm = SvmCoordinator::default();

        let ptr = svm
            .alloc(&devices, 64, 0, SvmMemFlags::ATOMICS, Some(&devices[0]))
            .unwrap();
        assert_eq!(plain.svm_alloc_calls(), 0);
        assert_eq!(atomic.live_svm(), vec![ptr]);
    }

    #[test]
    fn preferred_failure_aborts() {
        let log = EventLog::new();
        let a = svm_dev("a", CG, &log);
        let bad = failing_dev("bad", &log);
        let devices = [DeviceRef::from(a.clone()), DeviceRef::from(bad)];
        let svm = SvmCoordinator::default();

        assert!(svm.alloc(&devices, 64, 0, RW, Some(&devices[1])).is_none());
        assert_eq!(a.svm_alloc_calls(), 0);
    }

    #[test]
    fn rollback_frees_earlier_devices() {
        let log = EventLog::new();
        let a = svm_dev("a", CG, &log);
        let b = svm_dev("b", CG, &log);
        let c = failing_dev("c", &log);
        let devices = [
            DeviceRef::from(a.clone()),
            DeviceRef::from(b.clone()),
            DeviceRef::from(c),
        ];
        let svm = SvmCoordinator::new(SvmFailurePolicy::Rollback);

        assert!(svm.alloc(&devices, 64, 0, RW, None).is_none());
        assert!(a.live_svm().is_empty());
        assert!(b.live_svm().is_empty());
        assert_eq!(log.matching(":svm_free"), ["b:svm_free", "a:svm_free"]);
    }

    #[test]
    fn leak_policy_leaves_earlier_devices() {
        let log = EventLog::new();
        let a = svm_dev("a", CG, &log);
        let c = failing_dev("c", &log);
        let devices = [DeviceRef::from(a.clone()), DeviceRef::from(c)];
        let svm = SvmCoordinator::new(SvmFailurePolicy::Leak);

        assert!(svm.alloc(&devices, 64, 0, RW, None).is_none());
        assert_eq!(a.live_svm().len(), 1);
        assert_eq!(a.svm_free_calls(), 0);
    }

    #[test]
    fn concurrent_allocations_serialize() {
        let log = EventLog::new();
        let a = svm_dev("a", CG, &log);
        let b = svm_dev("b", CG, &log);
        let devices = [DeviceRef::from(a.clone()), DeviceRef::from(b.clone())];
        let devices: Arc<[DeviceRef]> = Arc::from(devices);
        let svm = Arc::new(SvmCoordinator::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let svm = Arc::clone(&svm);
                let devices = Arc::clone(&devices);
                std::thread::spawn(move || svm.alloc(&devices, 64, 0, RW, None).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Each allocation is an a/b pair with nothing interleaved.
        let events = log.matching(":svm_alloc");
        assert_eq!(events.len(), 16);
        for pair in events.chunks(2) {
            assert_eq!(pair, ["a:svm_alloc", "b:svm_alloc"]);
        }
        assert_eq!(a.live_svm(), b.live_svm());
    }
}
