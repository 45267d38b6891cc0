//! The context façade.
//!
//! A [`Context`] binds a client session to a fixed [`DeviceSet`]. It is built
//! from a negotiated [`ContextInfo`], finalized by [`Context::create`] and
//! torn down on drop: bound devices are unbound, every device is notified,
//! device handles are released, and the property copy and graphics table
//! are freed, in that order.

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::device::{DeviceRef, SvmMemFlags, SvmPtr};
use crate::device_queue::{DeviceQueueRegistry, QueueId};
use crate::device_set::DeviceSet;
use crate::error::{ContextError, Result};
use crate::host_memory::HostMemory;
use crate::interop::{
    DynamicGlLoader, GraphicsLibrary, GraphicsLoader, InteropBinder, init_graphics,
};
use crate::properties::{ContextFlags, ContextInfo, PlatformId, PropertyNegotiator, RawProperty};
use crate::svm::SvmCoordinator;

/// Builder for [`Context`].
#[derive(Debug)]
pub struct ContextBuilder {
    platform: PlatformId,
    devices: Vec<DeviceRef>,
    config: RuntimeConfig,
    loader: Option<Arc<dyn GraphicsLoader>>,
}

impl ContextBuilder {
    /// Start a context on `platform`, the identity checked against the
    /// platform property during negotiation.
    pub fn new(platform: PlatformId) -> Self {
        Self {
            platform,
            devices: Vec::new(),
            config: RuntimeConfig::default(),
            loader: None,
        }
    }

    pub fn device(mut self, device: impl Into<DeviceRef>) -> Self {
        self.devices.push(device.into());
        self
    }

    pub fn devices(mut self, devices: impl IntoIterator<Item = DeviceRef>) -> Self {
        self.devices.extend(devices);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the graphics library loader (defaults to [`DynamicGlLoader`]).
    pub fn graphics_loader(mut self, loader: Arc<dyn GraphicsLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Construct a context from an already negotiated configuration.
    /// The context still needs [`Context::create`].
    pub fn build(self, info: ContextInfo) -> Context {
        let loader: Arc<dyn GraphicsLoader> = match self.loader {
            Some(loader) => loader,
            None => Arc::new(DynamicGlLoader::new(self.config.gl_library.clone())),
        };
        Context::new(self.devices, info, self.config, loader)
    }

    /// Negotiate `properties`, construct and create the context.
    ///
    /// Negotiation failures return before any context exists. Creation
    /// failures drop the constructed context, which runs full teardown.
    pub fn create(self, properties: Option<&[RawProperty]>) -> Result<Context> {
        let info = PropertyNegotiator::new(self.platform).negotiate_raw(properties)?;
        let mut context = self.build(info);
        context.create(properties)?;
        Ok(context)
    }
}

/// A compute context: devices, negotiated configuration and cross-device memory.
#[derive(Debug)]
pub struct Context {
    // Field order is teardown order after `Drop::drop` has run.
    devices: DeviceSet,
    host: HostMemory,
    binder: InteropBinder,
    svm: SvmCoordinator,
    queues: DeviceQueueRegistry,
    info: ContextInfo,
    config: RuntimeConfig,
    properties: Option<Vec<RawProperty>>,
    graphics: Option<Box<dyn GraphicsLibrary>>,
    loader: Arc<dyn GraphicsLoader>,
}

impl Context {
    fn new(
        devices: Vec<DeviceRef>,
        info: ContextInfo,
        config: RuntimeConfig,
        loader: Arc<dyn GraphicsLoader>,
    ) -> Self {
        let devices = DeviceSet::new(devices);
        let host = HostMemory::new(devices.custom_host_alloc_device().cloned());
        Self {
            host,
            binder: InteropBinder::new(),
            svm: SvmCoordinator::new(config.svm_failure_policy),
            queues: DeviceQueueRegistry::new(),
            devices,
            info,
            config,
            properties: None,
            graphics: None,
            loader,
        }
    }

    /// Finalize the context: keep a copy of `properties` and bind interop.
    ///
    /// `properties` must be the list `info` was negotiated from. On error
    /// the context remains valid and must still be dropped.
    pub fn create(&mut self, properties: Option<&[RawProperty]>) -> Result<()> {
        if let Some(raw) = properties {
            if self.config.keep_property_copy {
                self.properties = Some(self.duplicate_properties(raw)?);
            }
        }

        if let Err(e) = self.binder.bind(self.devices.devices(), &self.info) {
            warn!(error = %e, "context interop binding failed");
            return Err(e);
        }

        if self.info.flags.contains(ContextFlags::GL_DEVICE_KHR) && self.graphics.is_none() {
            self.graphics = Some(init_graphics(&self.info, self.loader.as_ref())?);
        }

        info!(
            devices = self.devices.len(),
            svm_devices = self.devices.svm_devices().len(),
            flags = ?self.info.flags,
            "context created"
        );
        Ok(())
    }

    fn duplicate_properties(&self, raw: &[RawProperty]) -> Result<Vec<RawProperty>> {
        let words = self.info.property_words();
        let Some(source) = raw.get(..words) else {
            return Err(ContextError::invalid_value(format!(
                "property list has {} words, negotiated size needs {words}",
                raw.len()
            )));
        };
        let mut copy = Vec::new();
        if copy.try_reserve_exact(words).is_err() {
            return Err(ContextError::OutOfHostMemory {
                requested_bytes: self.info.properties_size,
            });
        }
        copy.extend_from_slice(source);
        Ok(copy)
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn devices(&self) -> &[DeviceRef] {
        self.devices.devices()
    }

    /// SVM-capable devices in allocation order.
    pub fn svm_devices(&self) -> &[DeviceRef] {
        self.devices.svm_devices()
    }

    pub fn custom_host_alloc_device(&self) -> Option<&DeviceRef> {
        self.devices.custom_host_alloc_device()
    }

    pub fn contains_device(&self, device: &DeviceRef) -> bool {
        self.devices.contains(device)
    }

    /// The duplicated creation property list, terminator included.
    pub fn properties(&self) -> Option<&[RawProperty]> {
        self.properties.as_deref()
    }

    pub fn has_graphics_interop(&self) -> bool {
        self.graphics.is_some()
    }

    // ── Memory ──────────────────────────────────────────────────────────────

    /// Allocate one SVM region mirrored on every SVM device.
    pub fn svm_alloc(
        &self,
        size: usize,
        alignment: usize,
        flags: SvmMemFlags,
        preferred: Option<&DeviceRef>,
    ) -> Option<SvmPtr> {
        let devices = self.devices.svm_devices();
        self.svm.alloc(devices, size, alignment, flags, preferred)
    }

    /// Free an SVM region on every SVM device.
    pub fn svm_free(&self, ptr: SvmPtr) {
        self.svm.free(self.devices.svm_devices(), ptr);
    }

    pub fn host_alloc(&self, size: usize, alignment: usize, atomics: bool) -> Option<NonNull<u8>> {
        self.host.alloc(size, alignment, atomics)
    }

    pub fn host_free(&self, ptr: NonNull<u8>) {
        self.host.free(ptr);
    }

    // ── On-device queues ────────────────────────────────────────────────────

    pub fn can_add_device_queue(&self, device: &DeviceRef) -> bool {
        self.queues.can_add_queue(device)
    }

    pub fn add_device_queue(&mut self, device: &DeviceRef, queue: QueueId, is_default: bool) {
        self.queues.add(device, queue, is_default);
    }

    /// # Panics
    ///
    /// Panics if `device` has no live on-device queues.
    pub fn remove_device_queue(&mut self, device: &DeviceRef, queue: QueueId) {
        self.queues.remove(device, queue);
    }

    pub fn default_device_queue(&self, device: &DeviceRef) -> Option<QueueId> {
        self.queues.default_queue(device)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for dev in self.devices.devices() {
            if self.info.has_interop() {
                self.binder.unbind(dev, &self.info);
            }
            dev.context_destroy();
        }
        debug!(devices = self.devices.len(), "context destroyed");
    }
}
