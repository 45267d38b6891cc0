//! Status codes surfaced to API callers and the error type behind them.

use thiserror::Error;

/// Status codes returned by context operations (subset of the OpenCL codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ClStatus {
    Success = 0,
    OutOfHostMemory = -6,
    InvalidValue = -30,
    InvalidGlSharegroupReference = -1000,
    InvalidD3d10Device = -1002,
    InvalidD3d11Device = -1006,
    InvalidDx9MediaAdapter = -1010,
}

impl ClStatus {
    /// Raw numeric value as seen by API callers.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw code back to a status. Unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            -6 => Some(Self::OutOfHostMemory),
            -30 => Some(Self::InvalidValue),
            -1000 => Some(Self::InvalidGlSharegroupReference),
            -1002 => Some(Self::InvalidD3d10Device),
            -1006 => Some(Self::InvalidD3d11Device),
            -1010 => Some(Self::InvalidDx9MediaAdapter),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Errors produced while negotiating, creating or tearing down a context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// A property name or value was rejected during negotiation.
    #[error("invalid context property value: {reason}")]
    InvalidValue { reason: String },

    /// The graphics display or context handle could not be used.
    #[error("invalid graphics sharegroup reference: {reason}")]
    InvalidGlSharegroupReference { reason: String },

    /// A Direct3D 10 device failed to bind to one or more compute devices.
    #[error("invalid Direct3D 10 device: {reason}")]
    InvalidD3d10Device { reason: String },

    /// A Direct3D 11 device failed to bind to one or more compute devices.
    #[error("invalid Direct3D 11 device: {reason}")]
    InvalidD3d11Device { reason: String },

    /// A Direct3D 9 media adapter failed to bind to one or more compute devices.
    #[error("invalid DX9 media adapter: {reason}")]
    InvalidDx9MediaAdapter { reason: String },

    /// Host storage for context bookkeeping could not be allocated.
    #[error("out of host memory: requested {requested_bytes} bytes")]
    OutOfHostMemory { requested_bytes: usize },
}

impl ContextError {
    pub(crate) fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_gl(reason: impl Into<String>) -> Self {
        Self::InvalidGlSharegroupReference {
            reason: reason.into(),
        }
    }

    /// The status code reported to the API caller for this error.
    pub fn status(&self) -> ClStatus {
        match self {
            Self::InvalidValue { .. } => ClStatus::InvalidValue,
            Self::InvalidGlSharegroupReference { .. } => ClStatus::InvalidGlSharegroupReference,
            Self::InvalidD3d10Device { .. } => ClStatus::InvalidD3d10Device,
            Self::InvalidD3d11Device { .. } => ClStatus::InvalidD3d11Device,
            Self::InvalidDx9MediaAdapter { .. } => ClStatus::InvalidDx9MediaAdapter,
            Self::OutOfHostMemory { .. } => ClStatus::OutOfHostMemory,
        }
    }
}

/// Convenience result alias for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Collapse a context result into the status code an API entry point returns.
pub fn status_of<T>(result: &Result<T>) -> ClStatus {
    match result {
        Ok(_) => ClStatus::Success,
        Err(e) => e.status(),
    }
}
