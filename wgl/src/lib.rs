//! # RedLilium WGL
//!
//! Resource handles and thread binding for a WGL-style OpenGL layer.
//!
//! Driver objects (rendering contexts and pbuffers) never leave this crate;
//! callers get generation-checked [`Handle`]s instead. On top of the handle
//! table the crate provides:
//!
//! - the current-context protocol, where a context is current on at most one
//!   thread and binding someone else's context fails fast with
//!   [`WglError::Busy`]
//! - a buffer mapping shim that serves mappings through 16-byte aligned
//!   shadow buffers when the driver's address is out of the caller's reach
//! - debug callback forwarding from drivers to the callback registered on the
//!   emitting thread's current context
//!
//! ## Architecture
//!
//! - [`Wgl`] - instance owning the handle table and surface registry
//! - [`HandleTable`] - slot table with a free list and per-slot generations
//! - [`Driver`] - function table behind each surface
//! - [`MappingShim`] - per-thread shadow buffer bookkeeping
//! - [`entry`] - flat boolean entry points over [`Wgl::global`]
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use redlilium_wgl::{BufferKey, DeviceContext, Driver, DummyDriver, MapAccess, MapRequest, Wgl, WglParameters};
//!
//! let driver = Arc::new(DummyDriver::new());
//! driver.create_buffer(BufferKey::Named(1), &[0; 64]);
//!
//! let wgl = Wgl::new(WglParameters::default());
//! let dc = DeviceContext(1);
//! wgl.register_surface(dc, driver.clone() as Arc<dyn Driver>);
//!
//! let ctx = wgl.create_context(dc).unwrap();
//! wgl.make_current(Some(dc), Some(ctx)).unwrap();
//!
//! let ptr = wgl
//!     .map_buffer(&MapRequest::whole(BufferKey::Named(1), MapAccess::WRITE))
//!     .unwrap();
//! unsafe { ptr.as_ptr().write(7) };
//! wgl.unmap_buffer(BufferKey::Named(1)).unwrap();
//! assert_eq!(driver.buffer_contents(BufferKey::Named(1)).unwrap()[0], 7);
//! ```

pub mod context;
mod current;
pub mod debug;
pub mod driver;
pub mod entry;
pub mod error;
pub mod extensions;
pub mod handle;
pub mod instance;
pub mod mapping;
pub mod params;
pub mod table;

pub use context::ContextPayload;
pub use debug::{DebugCallback, DebugRegistration, DebugUserData};
pub use driver::{
    BufferAccess, BufferKey, ContextAttrib, DebugMessage, DebugSink, DeviceContext, Driver,
    DriverContext, DriverPbuffer, DummyDriver, MapAccess, MapOutcome, MapRequest, MapTransfer,
    MappedPtr, NarrowAddressDriver, NullDriver, PbufferAttribute, PointerWidth, UnmapOutcome,
    UnmapTransfer,
};
pub use error::{DriverError, ErrorCode, WglError};
pub use extensions::{ExtensionFilter, ExtensionList};
pub use handle::{Handle, HandleType};
pub use instance::Wgl;
pub use mapping::{MappingShim, ShadowBuffer};
pub use params::WglParameters;
pub use table::{Entry, HandleTable, SlotPayload, SlotRef, TableGuard};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the library version.
pub fn init() {
    log::info!("RedLilium WGL v{}", VERSION);
}
