//! WGL error types.

use thiserror::Error;

/// Errors reported by a [`Driver`](crate::driver::Driver) entry point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The driver call itself failed.
    #[error("driver call failed: {0}")]
    Failed(String),
    /// The driver does not implement the entry point.
    #[error("driver does not implement {0}")]
    Unsupported(&'static str),
    /// The driver ran out of memory.
    #[error("driver out of memory")]
    OutOfMemory,
}

/// Errors that can occur in the WGL layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WglError {
    /// Stale, out-of-range or wrong-type handle.
    #[error("invalid handle")]
    InvalidHandle,
    /// The context is current in another thread.
    #[error("context is current in another thread")]
    Busy,
    /// The handle table has no free slot left.
    #[error("handle table exhausted ({capacity} slots)")]
    ResourceExhausted {
        /// Capacity of the exhausted table.
        capacity: usize,
    },
    /// A mapped buffer address cannot be expressed in the caller's pointer width.
    #[error("mapping of {size} bytes is not addressable by the caller")]
    AddressUnrepresentable {
        /// Size of the mapping that could not be handed out.
        size: usize,
    },
    /// The underlying driver call failed.
    #[error(transparent)]
    DriverFailure(#[from] DriverError),
}

impl WglError {
    /// Get the error code recorded as the thread's last error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidHandle => ErrorCode::InvalidHandle,
            Self::Busy => ErrorCode::Busy,
            Self::ResourceExhausted { .. } => ErrorCode::NotEnoughMemory,
            Self::AddressUnrepresentable { .. } => ErrorCode::InvalidAddress,
            Self::DriverFailure(_) => ErrorCode::DriverFailure,
        }
    }
}

/// Numeric error codes exposed through [`get_last_error`](crate::entry::get_last_error).
///
/// Values follow the platform's system error numbering so callers can
/// compare them against the codes they already know.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    /// No error recorded.
    #[default]
    Success = 0,
    /// Invalid handle.
    InvalidHandle = 6,
    /// Not enough memory (handle table exhausted).
    NotEnoughMemory = 8,
    /// Driver failure.
    DriverFailure = 31,
    /// Resource busy.
    Busy = 170,
    /// Address not representable.
    InvalidAddress = 487,
}

impl ErrorCode {
    /// Get the raw numeric value.
    pub fn raw(self) -> u32 {
        self as u32
    }
}
