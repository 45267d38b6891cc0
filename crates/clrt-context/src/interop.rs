//! Binding a context to external graphics / 3D-adapter devices.
//!
//! [`InteropBinder`] fans the negotiated handles out to every device and
//! remembers which devices accepted them, so teardown unbinds exactly those.
//! Graphics interop additionally needs the platform GL library; it is loaded
//! through a [`GraphicsLoader`] and owned by the context that loaded it.

use std::ffi::c_void;
use std::fmt;

use tracing::{debug, warn};

use crate::device::DeviceRef;
use crate::error::{ContextError, Result};
use crate::properties::{ContextFlags, ContextInfo, ExternalHandle, InteropSlot, RawProperty};

// ── Device binding ──────────────────────────────────────────────────────────

/// Devices bound to the external adapter described by a [`ContextInfo`].
#[derive(Debug, Default)]
pub struct InteropBinder {
    bound: Vec<DeviceRef>,
}

impl InteropBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every device when `info` requests interop.
    ///
    /// Every device is attempted even after a failure; devices that accepted
    /// the binding are remembered either way. Devices already bound are not
    /// bound again. The error reflects the highest precedence interop kind
    /// present in `info.flags`.
    pub fn bind(&mut self, devices: &[DeviceRef], info: &ContextInfo) -> Result<()> {
        if !info.has_interop() {
            return Ok(());
        }

        let mut failed = 0usize;
        for dev in devices {
            if self.bound.contains(dev) {
                debug!(device = %dev.info().name, "external device already bound");
                continue;
            }
            if dev.bind_external_device(info.flags, &info.handles, info.gl_context, false) {
                debug!(device = %dev.info().name, flags = ?info.flags, "bound external device");
                self.bound.push(dev.clone());
            } else {
                warn!(device = %dev.info().name, flags = ?info.flags, "external binding failed");
                failed += 1;
            }
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(binding_error(info.flags, failed, devices.len()))
        }
    }

    /// Unbind `device` if it was bound. Returns whether an unbind was issued.
    pub fn unbind(&mut self, device: &DeviceRef, info: &ContextInfo) -> bool {
        let Some(pos) = self.bound.iter().position(|d| d == device) else {
            return false;
        };
        let dev = self.bound.swap_remove(pos);
        dev.unbind_external_device(info.flags, &info.handles, info.gl_context, false);
        debug!(device = %dev.info().name, "unbound external device");
        true
    }

    pub fn is_bound(&self, device: &DeviceRef) -> bool {
        self.bound.contains(device)
    }

    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }
}

/// Graphics failures outrank Direct3D 10, then 11, then the D3D9 family.
fn binding_error(flags: ContextFlags, failed: usize, total: usize) -> ContextError {
    let reason = format!("{failed} of {total} device(s) rejected the external device");
    if flags.contains(ContextFlags::GL_DEVICE_KHR) {
        ContextError::InvalidGlSharegroupReference { reason }
    } else if flags.contains(ContextFlags::D3D10_DEVICE_KHR) {
        ContextError::InvalidD3d10Device { reason }
    } else if flags.contains(ContextFlags::D3D11_DEVICE_KHR) {
        ContextError::InvalidD3d11Device { reason }
    } else if flags.intersects(ContextFlags::D3D9_ANY) {
        ContextError::InvalidDx9MediaAdapter { reason }
    } else {
        ContextError::InvalidValue { reason }
    }
}

// ── Graphics library ────────────────────────────────────────────────────────

/// Window-system binding used to reach the client's GL context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsApi {
    Egl,
    Glx,
    Wgl,
}

impl GraphicsApi {
    /// API implied by negotiated flags on this platform.
    pub fn for_flags(flags: ContextFlags) -> Self {
        if flags.contains(ContextFlags::EGL_DEVICE_KHR) {
            Self::Egl
        } else if cfg!(windows) {
            Self::Wgl
        } else {
            Self::Glx
        }
    }

    pub fn default_library(self) -> &'static str {
        match self {
            Self::Egl if cfg!(windows) => "libEGL.dll",
            Self::Egl => "libEGL.so.1",
            Self::Glx => "libGL.so.1",
            Self::Wgl => "OpenGL32.dll",
        }
    }

    fn current_context_symbol(self) -> &'static [u8] {
        match self {
            Self::Egl => b"eglGetCurrentContext\0",
            Self::Glx => b"glXGetCurrentContext\0",
            Self::Wgl => b"wglGetCurrentContext\0",
        }
    }

    fn current_display_symbol(self) -> &'static [u8] {
        match self {
            Self::Egl => b"eglGetCurrentDisplay\0",
            Self::Glx => b"glXGetCurrentDisplay\0",
            Self::Wgl => b"wglGetCurrentDC\0",
        }
    }
}

/// Errors from loading a graphics library.
#[derive(Debug, thiserror::Error)]
pub enum GraphicsError {
    #[error("failed to load graphics library '{name}': {reason}")]
    LibraryLoad { name: String, reason: String },

    #[error("graphics library '{library}' is missing symbol '{symbol}'")]
    MissingSymbol { library: String, symbol: String },
}

/// A loaded graphics function table.
pub trait GraphicsLibrary: Send + Sync + fmt::Debug {
    /// Handshake with the client's display and GL context.
    ///
    /// Returns `false` unless `context` is the GL context current on the
    /// calling thread (and `display`, when non-null, its current display).
    fn init(&mut self, display: ExternalHandle, context: ExternalHandle) -> bool;

    fn api(&self) -> GraphicsApi;
}

/// Produces graphics function tables.
pub trait GraphicsLoader: Send + Sync + fmt::Debug {
    fn load(
        &self,
        api: GraphicsApi,
    ) -> std::result::Result<Box<dyn GraphicsLibrary>, GraphicsError>;
}

/// Build and handshake the graphics table for `info`.
///
/// A table that fails the handshake is dropped before returning.
pub fn init_graphics(
    info: &ContextInfo,
    loader: &dyn GraphicsLoader,
) -> Result<Box<dyn GraphicsLibrary>> {
    let api = GraphicsApi::for_flags(info.flags);
    let mut library = loader
        .load(api)
        .map_err(|e| ContextError::invalid_gl(e.to_string()))?;
    let gl_display = info.handles.get(InteropSlot::Gl);
    if !library.init(gl_display, info.gl_context) {
        return Err(ContextError::invalid_gl(format!(
            "{api:?} handshake failed for display {gl_display} and context {}",
            info.gl_context
        )));
    }
    debug!(?api, %gl_display, "graphics interop initialized");
    Ok(library)
}

type CurrentHandleFn = unsafe extern "system" fn() -> *mut c_void;

/// Loads the platform GL library with `libloading`.
#[derive(Debug, Clone, Default)]
pub struct DynamicGlLoader {
    library_override: Option<String>,
}

impl DynamicGlLoader {
    pub fn new(library_override: Option<String>) -> Self {
        Self { library_override }
    }
}

impl GraphicsLoader for DynamicGlLoader {
    fn load(
        &self,
        api: GraphicsApi,
    ) -> std::result::Result<Box<dyn GraphicsLibrary>, GraphicsError> {
        let name = self
            .library_override
            .clone()
            .unwrap_or_else(|| api.default_library().to_string());
        // SAFETY: loading a system GL library runs its initializers, which
        // have no preconditions beyond the process being alive.
        let library = match unsafe { libloading::Library::new(&name) } {
            Ok(library) => library,
            Err(e) => {
                return Err(GraphicsError::LibraryLoad {
                    name,
                    reason: e.to_string(),
                });
            }
        };
        let table = GlFunctions::resolve(library, name, api)?;
        Ok(Box::new(table))
    }
}

/// GL entry points resolved from a loaded library.
pub struct GlFunctions {
    name: String,
    api: GraphicsApi,
    get_current_context: CurrentHandleFn,
    get_current_display: CurrentHandleFn,
    display: ExternalHandle,
    context: ExternalHandle,
    // Keeps the function pointers above valid; dropped last.
    _library: libloading::Library,
}

impl GlFunctions {
    fn resolve(
        library: libloading::Library,
        name: String,
        api: GraphicsApi,
    ) -> std::result::Result<Self, GraphicsError> {
        let get_current_context = resolve_symbol(&library, &name, api.current_context_symbol())?;
        let get_current_display = resolve_symbol(&library, &name, api.current_display_symbol())?;
        Ok(Self {
            name,
            api,
            get_current_context,
            get_current_display,
            display: ExternalHandle::NULL,
            context: ExternalHandle::NULL,
            _library: library,
        })
    }

    pub fn library_name(&self) -> &str {
        &self.name
    }

    /// Whether the client's context is current on the calling thread.
    pub fn is_current(&self) -> bool {
        // SAFETY: zero-argument queries resolved from the still-loaded library.
        let context = unsafe { (self.get_current_context)() };
        // SAFETY: as above.
        let display = unsafe { (self.get_current_display)() };
        let current_context = ExternalHandle::from_raw(context as RawProperty);
        let current_display = ExternalHandle::from_raw(display as RawProperty);
        matches_current(
            (current_context, current_display),
            self.context,
            self.display,
        )
    }
}

fn resolve_symbol(
    library: &libloading::Library,
    name: &str,
    symbol: &[u8],
) -> std::result::Result<CurrentHandleFn, GraphicsError> {
    // SAFETY: both symbols are zero-argument query functions returning a
    // handle, matching `CurrentHandleFn`.
    match unsafe { library.get::<CurrentHandleFn>(symbol) } {
        Ok(sym) => Ok(*sym),
        Err(_) => {
            let symbol = symbol.strip_suffix(b"\0").unwrap_or(symbol);
            Err(GraphicsError::MissingSymbol {
                library: name.to_string(),
                symbol: String::from_utf8_lossy(symbol).into_owned(),
            })
        }
    }
}

/// `context` must be the current context; a non-null `display` must be the
/// current display.
fn matches_current(
    current: (ExternalHandle, ExternalHandle),
    context: ExternalHandle,
    display: ExternalHandle,
) -> bool {
    let (current_context, current_display) = current;
    !context.is_null()
        && current_context == context
        && (display.is_null() || current_display == display)
}

impl GraphicsLibrary for GlFunctions {
    fn init(&mut self, display: ExternalHandle, context: ExternalHandle) -> bool {
        self.display = display;
        self.context = context;
        let current = self.is_current();
        if !current {
            warn!(library = %self.name, %context, "GL context is not current");
        }
        current
    }

    fn api(&self) -> GraphicsApi {
        self.api
    }
}

impl fmt::Debug for GlFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlFunctions")
            .field("name", &self.name)
            .field("api", &self.api)
            .field("display", &self.display)
            .field("context", &self.context)
            .finish()
    }
}
