//! Driver abstraction.
//!
//! A [`Driver`] is the function table behind a surface: it creates the real
//! rendering contexts and pbuffers, binds them, and maps buffers. The WGL layer
//! never touches driver objects directly; it stores the values a driver hands
//! out and calls back into the same driver to act on them.
//!
//! # Drivers
//!
//! - [`NullDriver`] - fallback table installed when no context is current
//! - [`DummyDriver`] - in-memory driver for testing
//! - [`NarrowAddressDriver`] - adapter for callers with a narrower pointer width
//!
//! # Map protocol
//!
//! Buffer mapping uses a two-step protocol. A direct map request either
//! succeeds, fails, or reports that the mapping is
//! [`Unrepresentable`](MapOutcome::Unrepresentable) in the caller's address
//! space together with the size it needs. The caller may then retry with
//! [`MapTransfer::CopyInto`] and a caller-owned region the driver fills with
//! the buffer contents. Unmapping mirrors this with [`UnmapTransfer::CopyBack`].

mod dummy;
mod narrow;
mod null;

pub use dummy::DummyDriver;
pub use narrow::{NarrowAddressDriver, PointerWidth};
pub use null::NullDriver;

use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::DriverError;

/// Opaque reference to a drawable surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceContext(pub u64);

/// Driver-side rendering context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverContext(pub u64);

/// Driver-side pbuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverPbuffer(pub u64);

/// Attribute passed to context creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAttrib {
    /// Requested major version.
    MajorVersion(i32),
    /// Requested minor version.
    MinorVersion(i32),
    /// Context flags (debug, forward compatible).
    Flags(i32),
    /// Core or compatibility profile mask.
    ProfileMask(i32),
}

impl ContextAttrib {
    /// Whether an attribute list requests a 3.0+ context.
    ///
    /// Only the first major version entry is considered.
    pub fn requests_v3(attribs: &[ContextAttrib]) -> bool {
        attribs
            .iter()
            .find_map(|attrib| match attrib {
                Self::MajorVersion(major) => Some(*major >= 3),
                _ => None,
            })
            .unwrap_or(false)
    }
}

/// Queryable pbuffer attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PbufferAttribute {
    /// Width in pixels.
    Width,
    /// Height in pixels.
    Height,
    /// Non-zero when the pbuffer contents were lost.
    Lost,
}

bitflags! {
    /// Buffer mapping access bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapAccess: u32 {
        /// Mapping may be read.
        const READ = 0x0001;
        /// Mapping may be written.
        const WRITE = 0x0002;
        /// Previous contents of the range may be discarded.
        const INVALIDATE_RANGE = 0x0004;
        /// Previous contents of the whole buffer may be discarded.
        const INVALIDATE_BUFFER = 0x0008;
        /// Modified ranges are flushed explicitly.
        const FLUSH_EXPLICIT = 0x0010;
        /// No implicit synchronization.
        const UNSYNCHRONIZED = 0x0020;
        /// Mapping stays valid while the buffer is used by the driver.
        const PERSISTENT = 0x0040;
        /// Persistent mapping is kept coherent automatically.
        const COHERENT = 0x0080;
    }
}

impl MapAccess {
    /// Whether previous contents need not be made visible in the mapping.
    pub fn discards_contents(self) -> bool {
        self.intersects(Self::INVALIDATE_RANGE | Self::INVALIDATE_BUFFER)
    }
}

/// Legacy whole-buffer access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAccess {
    /// Read-only mapping.
    ReadOnly,
    /// Write-only mapping.
    WriteOnly,
    /// Read-write mapping.
    ReadWrite,
}

impl From<BufferAccess> for MapAccess {
    fn from(access: BufferAccess) -> Self {
        match access {
            BufferAccess::ReadOnly => MapAccess::READ,
            BufferAccess::WriteOnly => MapAccess::WRITE,
            BufferAccess::ReadWrite => MapAccess::READ | MapAccess::WRITE,
        }
    }
}

/// Identifies the buffer a map request acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKey {
    /// Buffer bound to a target in the current context.
    Target(u32),
    /// Buffer object by name.
    Named(u32),
}

/// A buffer map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// Buffer to map.
    pub key: BufferKey,
    /// Byte offset of the mapped range.
    pub offset: usize,
    /// Length of the mapped range, `None` for the whole buffer.
    pub length: Option<usize>,
    /// Requested access.
    pub access: MapAccess,
}

impl MapRequest {
    /// Map the whole buffer bound to `target`.
    pub fn buffer(target: u32, access: BufferAccess) -> Self {
        Self::whole(BufferKey::Target(target), access.into())
    }

    /// Map a range of the buffer bound to `target`.
    pub fn buffer_range(target: u32, offset: usize, length: usize, access: MapAccess) -> Self {
        Self::range(BufferKey::Target(target), offset, length, access)
    }

    /// Map the whole named buffer.
    pub fn named(buffer: u32, access: BufferAccess) -> Self {
        Self::whole(BufferKey::Named(buffer), access.into())
    }

    /// Map a range of the named buffer.
    pub fn named_range(buffer: u32, offset: usize, length: usize, access: MapAccess) -> Self {
        Self::range(BufferKey::Named(buffer), offset, length, access)
    }

    /// Map a whole buffer.
    pub fn whole(key: BufferKey, access: MapAccess) -> Self {
        Self {
            key,
            offset: 0,
            length: None,
            access,
        }
    }

    /// Map a range of a buffer.
    pub fn range(key: BufferKey, offset: usize, length: usize, access: MapAccess) -> Self {
        Self {
            key,
            offset,
            length: Some(length),
            access,
        }
    }
}

/// Address of a mapped buffer range.
///
/// This is an address token; reading or writing through it is the caller's
/// responsibility and requires `unsafe`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: `MappedPtr` is never dereferenced by this crate. Access to the
// memory it names goes through `as_ptr`, which hands the raw pointer to the
// caller who must uphold the mapping's lifetime.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Wrap a non-null pointer.
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Wrap a raw pointer, `None` when null.
    pub fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Point at the start of `slice`.
    pub fn from_slice(slice: &mut [u8]) -> Self {
        Self(NonNull::from(slice).cast())
    }

    /// Get the raw pointer.
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Get the numeric address.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl std::fmt::Debug for MappedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MappedPtr({:#x})", self.addr())
    }
}

/// How a map call hands the buffer contents to the caller.
#[derive(Debug)]
pub enum MapTransfer<'a> {
    /// Return the driver's own mapping.
    Direct,
    /// Copy the mapped range into the caller-owned region and return it.
    CopyInto(&'a mut [u8]),
}

/// How an unmap call treats the caller's copy of the contents.
#[derive(Debug)]
pub enum UnmapTransfer<'a> {
    /// Unmap the driver's own mapping.
    Direct,
    /// Write the caller-owned region back before unmapping.
    CopyBack(&'a [u8]),
}

/// Result of a driver map call.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOutcome {
    /// Mapping succeeded.
    Mapped(MappedPtr),
    /// Mapping succeeded but its address is not usable by the caller.
    ///
    /// The buffer stays mapped on the driver side until a
    /// [`MapTransfer::CopyInto`] retry or an unmap.
    Unrepresentable {
        /// Bytes the caller must provide for a copy-mode retry.
        required: usize,
    },
    /// Mapping failed.
    Failed(DriverError),
}

/// Result of a driver unmap call.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmapOutcome {
    /// Buffer unmapped.
    Unmapped,
    /// The active mapping is a caller copy and needs [`UnmapTransfer::CopyBack`].
    Unrepresentable,
    /// Unmap failed.
    Failed(DriverError),
}

/// A debug notification emitted by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugMessage<'a> {
    /// Message source enum.
    pub source: u32,
    /// Message type enum.
    pub kind: u32,
    /// Message id.
    pub id: u32,
    /// Message severity enum.
    pub severity: u32,
    /// Message text.
    pub text: &'a str,
}

/// Driver-facing debug notification entry point.
pub type DebugSink = Arc<dyn Fn(&DebugMessage<'_>) + Send + Sync>;

/// Function table behind a surface.
///
/// Only context creation, deletion and binding are mandatory; every other
/// entry point reports [`DriverError::Unsupported`] unless overridden.
///
/// A driver must not invoke an installed [`DebugSink`] from inside one of its
/// own trait methods; notifications are delivered from rendering calls made
/// outside this crate.
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Driver name for logging.
    fn name(&self) -> &'static str;

    /// Create a rendering context on a surface.
    fn create_context(&self, dc: DeviceContext) -> Result<DriverContext, DriverError>;

    /// Create a rendering context from an attribute list.
    fn create_context_attribs(
        &self,
        _dc: DeviceContext,
        _share: Option<DriverContext>,
        _attribs: &[ContextAttrib],
    ) -> Result<DriverContext, DriverError> {
        Err(DriverError::Unsupported("create_context_attribs"))
    }

    /// Destroy a rendering context.
    fn delete_context(&self, ctx: DriverContext) -> Result<(), DriverError>;

    /// Bind a context to the calling thread, or unbind with `None`.
    fn make_current(
        &self,
        draw: Option<DeviceContext>,
        read: Option<DeviceContext>,
        ctx: Option<DriverContext>,
    ) -> Result<(), DriverError>;

    /// Copy state selected by `mask` from one context to another.
    fn copy_context(
        &self,
        _src: DriverContext,
        _dst: DriverContext,
        _mask: u32,
    ) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("copy_context"))
    }

    /// Share object namespaces between two contexts.
    fn share_lists(&self, _src: DriverContext, _dst: DriverContext) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("share_lists"))
    }

    /// Create an off-screen pbuffer.
    fn create_pbuffer(
        &self,
        _dc: DeviceContext,
        _format: i32,
        _width: i32,
        _height: i32,
    ) -> Result<DriverPbuffer, DriverError> {
        Err(DriverError::Unsupported("create_pbuffer"))
    }

    /// Destroy a pbuffer.
    fn destroy_pbuffer(&self, _pbuffer: DriverPbuffer) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("destroy_pbuffer"))
    }

    /// Get a surface for drawing into a pbuffer.
    fn pbuffer_dc(&self, _pbuffer: DriverPbuffer) -> Result<DeviceContext, DriverError> {
        Err(DriverError::Unsupported("pbuffer_dc"))
    }

    /// Release a surface obtained through [`pbuffer_dc`](Self::pbuffer_dc).
    fn release_pbuffer_dc(
        &self,
        _pbuffer: DriverPbuffer,
        _dc: DeviceContext,
    ) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("release_pbuffer_dc"))
    }

    /// Query a pbuffer attribute.
    fn query_pbuffer(
        &self,
        _pbuffer: DriverPbuffer,
        _attrib: PbufferAttribute,
    ) -> Result<i32, DriverError> {
        Err(DriverError::Unsupported("query_pbuffer"))
    }

    /// Map a buffer in the context current on the calling thread.
    fn map_buffer(&self, _request: &MapRequest, _transfer: MapTransfer<'_>) -> MapOutcome {
        MapOutcome::Failed(DriverError::Unsupported("map_buffer"))
    }

    /// Unmap a buffer in the context current on the calling thread.
    fn unmap_buffer(&self, _key: BufferKey, _transfer: UnmapTransfer<'_>) -> UnmapOutcome {
        UnmapOutcome::Failed(DriverError::Unsupported("unmap_buffer"))
    }

    /// Get the address of the active mapping of a buffer, as handed to the caller.
    fn mapped_pointer(&self, _key: BufferKey) -> Option<MappedPtr> {
        None
    }

    /// Get the size of a buffer in bytes.
    fn buffer_size(&self, _key: BufferKey) -> Result<usize, DriverError> {
        Err(DriverError::Unsupported("buffer_size"))
    }

    /// Install or remove the debug notification sink of a context.
    fn set_debug_sink(
        &self,
        _ctx: DriverContext,
        _sink: Option<DebugSink>,
    ) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("set_debug_sink"))
    }

    /// Get the extensions the driver advertises.
    fn extensions(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Whether two driver handles refer to the same driver instance.
pub fn same_driver(a: &Arc<dyn Driver>, b: &Arc<dyn Driver>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}
