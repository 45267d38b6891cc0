//! Context property negotiation.
//!
//! Clients describe a context with a flat, zero-terminated list of
//! `(name, value)` pairs. [`PropertyList`] turns the raw array into typed
//! pairs, and [`PropertyNegotiator`] validates them into a [`ContextInfo`].
//! Property names are resolved through [`PROPERTY_TABLE`] before any
//! validation runs, so aliasing between graphics display properties is an
//! explicit rule rather than an accident of dispatch order.

use std::collections::HashSet;
use std::fmt;

use bitflags::bitflags;
use tracing::debug;

use crate::error::{ContextError, Result};

/// Raw property word, pointer-sized and signed (`cl_context_properties`).
pub type RawProperty = isize;

/// Bytes in one property word.
pub const PROPERTY_WORD_SIZE: usize = std::mem::size_of::<RawProperty>();
/// Bytes in one `(name, value)` pair.
pub const PROPERTY_PAIR_SIZE: usize = 2 * PROPERTY_WORD_SIZE;
/// Bytes in the zero terminator.
pub const PROPERTY_TERMINATOR_SIZE: usize = PROPERTY_WORD_SIZE;

/// The boolean "true" token accepted by flag-style properties.
pub const PROPERTY_TRUE: RawProperty = 1;

// ── Property names ──────────────────────────────────────────────────────────

/// Every property name the negotiator recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyName {
    Platform,
    InteropUserSync,
    GlContext,
    EglDisplay,
    GlxDisplay,
    WglHdc,
    CglSharegroup,
    D3d10Device,
    D3d11Device,
    AdapterD3d9,
    AdapterD3d9Ex,
    AdapterDxva,
    OfflineDevices,
}

/// Raw name → typed name lookup, consulted before dispatch.
pub const PROPERTY_TABLE: &[(RawProperty, PropertyName)] = &[
    (0x1084, PropertyName::Platform),
    (0x1085, PropertyName::InteropUserSync),
    (0x2008, PropertyName::GlContext),
    (0x2009, PropertyName::EglDisplay),
    (0x200A, PropertyName::GlxDisplay),
    (0x200B, PropertyName::WglHdc),
    (0x200C, PropertyName::CglSharegroup),
    (0x4014, PropertyName::D3d10Device),
    (0x401D, PropertyName::D3d11Device),
    (0x2025, PropertyName::AdapterD3d9),
    (0x2026, PropertyName::AdapterD3d9Ex),
    (0x2027, PropertyName::AdapterDxva),
    (0x403F, PropertyName::OfflineDevices),
];

/// How a recognized property is validated and where its value lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyKind {
    Platform,
    UserSync,
    GlContext,
    GlDisplay { egl: bool },
    Adapter(InteropSlot),
    OfflineDevices,
}

impl PropertyName {
    /// Look up a raw property name.
    pub fn from_raw(raw: RawProperty) -> Option<Self> {
        PROPERTY_TABLE
            .iter()
            .find(|(code, _)| *code == raw)
            .map(|(_, name)| *name)
    }

    /// Raw wire value of this name.
    pub fn raw(self) -> RawProperty {
        PROPERTY_TABLE
            .iter()
            .find(|(_, name)| *name == self)
            .map(|(code, _)| *code)
            .unwrap_or_default()
    }

    /// Whether this build accepts the property at all.
    pub fn is_supported(self) -> bool {
        match self {
            Self::D3d10Device
            | Self::D3d11Device
            | Self::AdapterD3d9
            | Self::AdapterD3d9Ex
            | Self::AdapterDxva
            | Self::WglHdc => cfg!(windows),
            Self::GlxDisplay => cfg!(target_os = "linux"),
            Self::CglSharegroup => false,
            Self::Platform
            | Self::InteropUserSync
            | Self::GlContext
            | Self::EglDisplay
            | Self::OfflineDevices => true,
        }
    }

    fn kind(self) -> Option<PropertyKind> {
        let kind = match self {
            Self::Platform => PropertyKind::Platform,
            Self::InteropUserSync => PropertyKind::UserSync,
            Self::GlContext => PropertyKind::GlContext,
            Self::EglDisplay => PropertyKind::GlDisplay { egl: true },
            Self::GlxDisplay | Self::WglHdc => PropertyKind::GlDisplay { egl: false },
            Self::D3d10Device => PropertyKind::Adapter(InteropSlot::D3d10),
            Self::D3d11Device => PropertyKind::Adapter(InteropSlot::D3d11),
            Self::AdapterD3d9 => PropertyKind::Adapter(InteropSlot::D3d9),
            Self::AdapterD3d9Ex => PropertyKind::Adapter(InteropSlot::D3d9Ex),
            Self::AdapterDxva => PropertyKind::Adapter(InteropSlot::D3d9Va),
            Self::OfflineDevices => PropertyKind::OfflineDevices,
            Self::CglSharegroup => return None,
        };
        Some(kind)
    }
}

// ── Flags and handle table ──────────────────────────────────────────────────

bitflags! {
    /// Interop and feature flags recorded by negotiation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        const GL_DEVICE_KHR = 1 << 0;
        const D3D10_DEVICE_KHR = 1 << 1;
        const OFFLINE_DEVICES = 1 << 2;
        const INTEROP_USER_SYNC = 1 << 3;
        const D3D11_DEVICE_KHR = 1 << 4;
        const D3D9_DEVICE_KHR = 1 << 5;
        const D3D9_DEVICE_EX_KHR = 1 << 6;
        const D3D9_DEVICE_VA_KHR = 1 << 7;
        const EGL_DEVICE_KHR = 1 << 8;

        /// Any flag that requires binding devices to an external adapter.
        const INTEROP = Self::GL_DEVICE_KHR.bits()
            | Self::D3D10_DEVICE_KHR.bits()
            | Self::D3D11_DEVICE_KHR.bits()
            | Self::D3D9_DEVICE_KHR.bits()
            | Self::D3D9_DEVICE_EX_KHR.bits()
            | Self::D3D9_DEVICE_VA_KHR.bits();

        const D3D9_ANY = Self::D3D9_DEVICE_KHR.bits()
            | Self::D3D9_DEVICE_EX_KHR.bits()
            | Self::D3D9_DEVICE_VA_KHR.bits();
    }
}

/// Slot in the external handle table, one per interop kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteropSlot {
    Gl = 0,
    D3d10 = 1,
    D3d11 = 2,
    D3d9 = 3,
    D3d9Ex = 4,
    D3d9Va = 5,
}

impl InteropSlot {
    pub const COUNT: usize = 6;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Gl,
        Self::D3d10,
        Self::D3d11,
        Self::D3d9,
        Self::D3d9Ex,
        Self::D3d9Va,
    ];

    /// The flag that is set exactly when this slot is populated.
    pub fn flag(self) -> ContextFlags {
        match self {
            Self::Gl => ContextFlags::GL_DEVICE_KHR,
            Self::D3d10 => ContextFlags::D3D10_DEVICE_KHR,
            Self::D3d11 => ContextFlags::D3D11_DEVICE_KHR,
            Self::D3d9 => ContextFlags::D3D9_DEVICE_KHR,
            Self::D3d9Ex => ContextFlags::D3D9_DEVICE_EX_KHR,
            Self::D3d9Va => ContextFlags::D3D9_DEVICE_VA_KHR,
        }
    }
}

/// Opaque, pointer-sized handle owned by an external API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExternalHandle(usize);

impl ExternalHandle {
    pub const NULL: Self = Self(0);

    pub fn from_raw(raw: RawProperty) -> Self {
        Self(raw as usize)
    }

    pub fn as_raw(self) -> RawProperty {
        self.0 as RawProperty
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExternalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// External device handles indexed by [`InteropSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleTable([ExternalHandle; InteropSlot::COUNT]);

impl HandleTable {
    pub fn get(&self, slot: InteropSlot) -> ExternalHandle {
        self.0[slot as usize]
    }

    pub fn set(&mut self, slot: InteropSlot, handle: ExternalHandle) {
        self.0[slot as usize] = handle;
    }
}

/// Identity of the platform a context is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformId(usize);

impl PlatformId {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> RawProperty {
        self.0 as RawProperty
    }
}

// ── Typed property list ─────────────────────────────────────────────────────

/// One `(name, value)` pair as it appeared in the client's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyPair {
    pub name: RawProperty,
    pub value: RawProperty,
}

/// A zero-terminated property list decoded into typed pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyList {
    pairs: Vec<PropertyPair>,
}

impl PropertyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a recognized property.
    pub fn with(mut self, name: PropertyName, value: RawProperty) -> Self {
        self.pairs.push(PropertyPair {
            name: name.raw(),
            value,
        });
        self
    }

    /// Append a pair by raw name, recognized or not.
    pub fn with_raw(mut self, name: RawProperty, value: RawProperty) -> Self {
        self.pairs.push(PropertyPair { name, value });
        self
    }

    /// Decode a raw array up to (and including) its zero terminator.
    ///
    /// Words after the terminator are ignored. An array that ends before a
    /// terminator is rejected.
    pub fn from_raw(raw: &[RawProperty]) -> Result<Self> {
        let mut pairs = Vec::new();
        let mut words = raw.iter().copied();
        while let Some(name) = words.next() {
            if name == 0 {
                return Ok(Self { pairs });
            }
            let Some(value) = words.next() else {
                let reason = format!("property {name:#x} has no value");
                return Err(ContextError::invalid_value(reason));
            };
            pairs.push(PropertyPair { name, value });
        }
        let reason = "property list is not zero-terminated";
        Err(ContextError::invalid_value(reason))
    }

    /// Re-encode into the raw wire layout, terminator included.
    pub fn to_raw(&self) -> Vec<RawProperty> {
        let mut raw = Vec::with_capacity(self.pairs.len() * 2 + 1);
        for pair in &self.pairs {
            raw.push(pair.name);
            raw.push(pair.value);
        }
        raw.push(0);
        raw
    }

    /// Bytes occupied by the raw encoding.
    pub fn byte_size(&self) -> usize {
        self.pairs.len() * PROPERTY_PAIR_SIZE + PROPERTY_TERMINATOR_SIZE
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyPair> {
        self.pairs.iter()
    }
}

// ── Negotiated configuration ────────────────────────────────────────────────

/// Validated context configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextInfo {
    pub flags: ContextFlags,
    pub handles: HandleTable,
    /// Graphics context handle (`CL_GL_CONTEXT_KHR`).
    pub gl_context: ExternalHandle,
    /// Bytes needed to duplicate the client's list; zero when no list was given.
    pub properties_size: usize,
}

impl ContextInfo {
    /// Whether creation has to bind devices to an external adapter.
    pub fn has_interop(&self) -> bool {
        self.flags.intersects(ContextFlags::INTEROP)
    }

    /// Number of raw words in the duplicated property list.
    pub fn property_words(&self) -> usize {
        self.properties_size / PROPERTY_WORD_SIZE
    }

    /// Flags agree with the handle table: a slot flag is set exactly when
    /// the slot (or, for graphics, the context handle) was populated.
    pub fn is_consistent(&self) -> bool {
        InteropSlot::ALL.iter().all(|&slot| {
            let mut populated = !self.handles.get(slot).is_null();
            if slot == InteropSlot::Gl {
                populated |= !self.gl_context.is_null();
            }
            populated == self.flags.contains(slot.flag())
        })
    }
}

/// Validates property lists against the runtime's platform.
#[derive(Debug, Clone, Copy)]
pub struct PropertyNegotiator {
    platform: PlatformId,
}

impl PropertyNegotiator {
    pub fn new(platform: PlatformId) -> Self {
        Self { platform }
    }

    /// Decode and negotiate a raw list. `None` means "no properties".
    pub fn negotiate_raw(&self, raw: Option<&[RawProperty]>) -> Result<ContextInfo> {
        match raw {
            None => Ok(ContextInfo::default()),
            Some(raw) => self.negotiate(Some(&PropertyList::from_raw(raw)?)),
        }
    }

    /// Validate a property list. Any rejected pair aborts negotiation and no
    /// partial configuration is returned.
    pub fn negotiate(&self, list: Option<&PropertyList>) -> Result<ContextInfo> {
        let mut info = ContextInfo::default();
        let Some(list) = list else {
            return Ok(info);
        };

        let mut seen = HashSet::new();
        let mut display: Option<PropertyName> = None;

        for pair in list.iter() {
            let Some(name) = PropertyName::from_raw(pair.name) else {
                let reason = format!("unknown property {:#x}", pair.name);
                return Err(ContextError::invalid_value(reason));
            };
            let kind = match name.kind() {
                Some(kind) if name.is_supported() => kind,
                _ => {
                    return Err(ContextError::invalid_value(format!(
                        "property {name:?} is not supported on this platform"
                    )));
                }
            };
            if !seen.insert(name) {
                return Err(ContextError::invalid_value(format!(
                    "property {name:?} specified more than once"
                )));
            }

            let handle = ExternalHandle::from_raw(pair.value);
            match kind {
                PropertyKind::UserSync => {
                    if pair.value == PROPERTY_TRUE {
                        info.flags |= ContextFlags::INTEROP_USER_SYNC;
                    }
                }
                PropertyKind::Adapter(slot) => {
                    if handle.is_null() {
                        return Err(ContextError::invalid_value(format!(
                            "{name:?} requires a non-null handle"
                        )));
                    }
                    info.handles.set(slot, handle);
                    info.flags |= slot.flag();
                }
                PropertyKind::GlDisplay { egl } => {
                    if let Some(previous) = display {
                        return Err(ContextError::invalid_value(format!(
                            "{name:?} conflicts with {previous:?}: only one graphics display \
                             may be given"
                        )));
                    }
                    if handle.is_null() {
                        return Err(ContextError::invalid_gl(format!(
                            "{name:?} requires a non-null display"
                        )));
                    }
                    display = Some(name);
                    info.handles.set(InteropSlot::Gl, handle);
                    info.flags |= ContextFlags::GL_DEVICE_KHR;
                    if egl {
                        info.flags |= ContextFlags::EGL_DEVICE_KHR;
                    }
                }
                PropertyKind::GlContext => {
                    if handle.is_null() {
                        return Err(ContextError::invalid_gl(
                            "GlContext requires a non-null context handle",
                        ));
                    }
                    info.gl_context = handle;
                    info.flags |= ContextFlags::GL_DEVICE_KHR;
                }
                PropertyKind::Platform => {
                    if pair.value != 0 && pair.value != self.platform.as_raw() {
                        return Err(ContextError::invalid_value(format!(
                            "platform {:#x} is not this runtime's platform",
                            pair.value
                        )));
                    }
                }
                PropertyKind::OfflineDevices => {
                    if pair.value != PROPERTY_TRUE {
                        return Err(ContextError::invalid_value(format!(
                            "OfflineDevices expects the true token, got {}",
                            pair.value
                        )));
                    }
                    info.flags |= ContextFlags::OFFLINE_DEVICES;
                }
            }
        }

        info.properties_size = list.byte_size();
        debug!(
            pairs = list.len(),
            flags = ?info.flags,
            bytes = info.properties_size,
            "negotiated context properties"
        );
        Ok(info)
    }
}
