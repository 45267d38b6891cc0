//! Host allocations made on behalf of a context.
//!
//! When one of the context's devices provides a custom host allocator every
//! request goes there. Otherwise memory comes from the global allocator with
//! the requested alignment, and the context keeps the layout so it can free
//! the block later (or on drop).

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::device::{DeviceRef, MemorySegment};

#[derive(Debug)]
pub struct HostMemory {
    custom: Option<DeviceRef>,
    blocks: Mutex<HashMap<usize, Layout>>,
}

impl HostMemory {
    pub fn new(custom: Option<DeviceRef>) -> Self {
        Self {
            custom,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<usize, Layout>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `size` bytes aligned to `alignment` (0 means word alignment).
    pub fn alloc(&self, size: usize, alignment: usize, atomics: bool) -> Option<NonNull<u8>> {
        if let Some(dev) = &self.custom {
            return dev.host_alloc(size, alignment, MemorySegment::for_atomics(atomics));
        }
        if size == 0 {
            return None;
        }
        let align = alignment.max(std::mem::align_of::<usize>());
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        self.blocks().insert(ptr.as_ptr() as usize, layout);
        debug!(size, align, "host block allocated");
        Some(ptr)
    }

    /// Free a block returned by [`HostMemory::alloc`].
    pub fn free(&self, ptr: NonNull<u8>) {
        if let Some(dev) = &self.custom {
            dev.host_free(ptr);
            return;
        }
        let layout = self.blocks().remove(&(ptr.as_ptr() as usize));
        match layout {
            // SAFETY: the block was produced by `alloc::alloc` with this layout
            // and has just been removed from the table, so it is freed once.
            Some(layout) => unsafe { alloc::dealloc(ptr.as_ptr(), layout) },
            None => warn!(ptr = ?ptr, "ignoring free of unknown host block"),
        }
    }

    /// Blocks from the fallback allocator that are still live.
    pub fn live_blocks(&self) -> usize {
        self.blocks().len()
    }

    pub fn uses_device_allocator(&self) -> bool {
        self.custom.is_some()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        let blocks = match self.blocks.get_mut() {
            Ok(blocks) => blocks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !blocks.is_empty() {
            debug!(blocks = blocks.len(), "releasing leaked host blocks");
        }
        for (addr, layout) in blocks.drain() {
            // SAFETY: every entry is a live block allocated with its layout.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn fallback_respects_alignment() {
        let mem = HostMemory::new(None);
        let ptr = mem.alloc(100, 4096, false).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        assert_eq!(mem.live_blocks(), 1);
        mem.free(ptr);
        assert_eq!(mem.live_blocks(), 0);
    }

    #[test]
    fn fallback_rejects_bad_requests() {
        let mem = HostMemory::new(None);
        assert!(mem.alloc(0, 64, false).is_none());
        assert!(mem.alloc(64, 48, false).is_none());
    }

    #[test]
    fn drop_releases_leftovers() {
        let mem = HostMemory::new(None);
        mem.alloc(64, 0, false).unwrap();
        mem.alloc(64, 0, true).unwrap();
        assert_eq!(mem.live_blocks(), 2);
        drop(mem);
    }

    #[test]
    fn custom_device_takes_every_request() {
        let dev = MockDevice::builder("host")
            .custom_host_allocator()
            .build_arc();
        let mem = HostMemory::new(Some(DeviceRef::from(dev.clone())));
        let ptr = mem.alloc(64, 64, true).unwrap();
        mem.free(ptr);
        assert!(mem.uses_device_allocator());
        assert_eq!(dev.host_alloc_calls(), 1);
        assert_eq!(dev.host_free_calls(), 1);
        assert_eq!(mem.live_blocks(), 0);
    }
}
