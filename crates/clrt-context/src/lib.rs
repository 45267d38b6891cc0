//! `clrt-context`: the context object of an OpenCL-style compute runtime.
//!
//! A context binds a client session to a fixed set of compute devices. This
//! crate owns the parts of that job that span devices:
//!
//! | Module           | Responsibility                                            |
//! |------------------|-----------------------------------------------------------|
//! | [`properties`]   | Negotiate the client's property list into `ContextInfo`    |
//! | [`device_set`]   | Retain devices, derive SVM order and host-allocator device |
//! | [`interop`]      | Bind devices to graphics / Direct3D adapters, load GL      |
//! | [`svm`]          | All-or-nothing SVM allocation across devices               |
//! | [`device_queue`] | On-device queue counts and default queues                  |
//! | [`host_memory`]  | Route host allocations to a device or the global allocator |
//! | [`context`]      | The façade tying them together, plus teardown              |
//!
//! The device driver itself is out of scope and sits behind the [`Device`]
//! trait. [`mock::MockDevice`] implements it in memory.
//!
//! # Usage
//!
//! ```rust
//! use clrt_context::mock::MockDevice;
//! use clrt_context::{
//!     ContextBuilder, PlatformId, PropertyList, PropertyName, SvmCapabilities, SvmMemFlags,
//! };
//!
//! let platform = PlatformId::new(0x1000);
//! let gpu = MockDevice::builder("gpu0")
//!     .svm(SvmCapabilities::COARSE_GRAIN_BUFFER)
//!     .build_arc();
//! let props = PropertyList::new()
//!     .with(PropertyName::Platform, platform.as_raw())
//!     .to_raw();
//!
//! let ctx = ContextBuilder::new(platform)
//!     .device(gpu)
//!     .create(Some(&props))
//!     .unwrap();
//! let region = ctx
//!     .svm_alloc(4096, 256, SvmMemFlags::READ_WRITE, None)
//!     .unwrap();
//! ctx.svm_free(region);
//! assert_eq!(ctx.properties(), Some(props.as_slice()));
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod device_queue;
pub mod device_set;
pub mod error;
pub mod host_memory;
pub mod interop;
pub mod mock;
pub mod properties;
pub mod svm;

pub use config::{ConfigError, RuntimeConfig, SvmFailurePolicy};
pub use context::{Context, ContextBuilder};
pub use device::{
    Device, DeviceInfo, DeviceKey, DeviceRef, MemorySegment, SvmCapabilities, SvmMemFlags, SvmPtr,
};
pub use device_queue::{DeviceQueueInfo, DeviceQueueRegistry, QueueId};
pub use device_set::DeviceSet;
pub use error::{ClStatus, ContextError, Result, status_of};
pub use interop::{
    DynamicGlLoader, GraphicsApi, GraphicsError, GraphicsLibrary, GraphicsLoader, InteropBinder,
};
pub use properties::{
    ContextFlags, ContextInfo, ExternalHandle, HandleTable, InteropSlot, PlatformId, PropertyList,
    PropertyName, PropertyNegotiator, RawProperty,
};
pub use svm::SvmCoordinator;
