//! Buffer mapping shim.
//!
//! When caller and driver disagree on pointer width, a driver mapping may
//! live at an address the caller cannot hold. The driver reports this as
//! [`MapOutcome::Unrepresentable`] together with the size it needs; the shim
//! then allocates a 16-byte aligned shadow buffer, asks the driver to copy
//! the mapped range into it, and hands the shadow to the caller instead.
//!
//! On unmap, a direct unmap that comes back
//! [`UnmapOutcome::Unrepresentable`] means the active mapping is a shadow:
//! the driver copies it back and the shim frees it.
//!
//! Shadows belong to the thread that mapped them and live for exactly one
//! map/unmap cycle. Mapping the same buffer from two threads at once is the
//! caller's problem, as it is for the driver.

use std::cell::RefCell;
use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};

use crate::driver::{
    BufferKey, Driver, MapAccess, MapOutcome, MapRequest, MapTransfer, MappedPtr, UnmapOutcome,
    UnmapTransfer,
};
use crate::error::WglError;
use crate::instance::Wgl;

/// Alignment of shadow buffers in bytes.
pub const SHADOW_ALIGNMENT: usize = 16;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(16))]
struct ShadowChunk([u8; SHADOW_ALIGNMENT]);

/// Caller-visible stand-in for a driver mapping.
pub struct ShadowBuffer {
    chunks: Vec<ShadowChunk>,
    len: usize,
}

impl ShadowBuffer {
    /// Allocate a zeroed shadow of `len` bytes.
    pub fn new(len: usize) -> Self {
        let count = len.div_ceil(SHADOW_ALIGNMENT).max(1);
        Self {
            chunks: vec![ShadowChunk::zeroed(); count],
            len,
        }
    }

    /// Get the usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the shadow is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the contents.
    pub fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice::<ShadowChunk, u8>(&self.chunks)[..self.len]
    }

    /// Get the contents mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<ShadowChunk, u8>(&mut self.chunks)[..len]
    }

    /// Get the start address.
    pub fn addr(&self) -> usize {
        self.chunks.as_ptr() as usize
    }
}

impl std::fmt::Debug for ShadowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

/// Per-thread shadow buffer bookkeeping.
#[derive(Debug, Default)]
pub struct MappingShim {
    shadows: HashMap<BufferKey, ShadowBuffer>,
}

impl MappingShim {
    /// Create an empty shim.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live shadow buffers.
    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }

    /// Whether `key` is currently served from a shadow.
    pub fn is_shadowed(&self, key: BufferKey) -> bool {
        self.shadows.contains_key(&key)
    }

    /// Map a buffer, falling back to a shadow when the driver's address is unusable.
    pub fn map(&mut self, driver: &dyn Driver, request: &MapRequest) -> Result<MappedPtr, WglError> {
        match driver.map_buffer(request, MapTransfer::Direct) {
            MapOutcome::Mapped(ptr) => {
                if self.shadows.remove(&request.key).is_some() {
                    log::debug!("MappingShim: dropping stale shadow of {:?}", request.key);
                }
                Ok(ptr)
            }
            MapOutcome::Unrepresentable { required } => self.map_shadowed(driver, request, required),
            MapOutcome::Failed(error) => Err(error.into()),
        }
    }

    fn map_shadowed(
        &mut self,
        driver: &dyn Driver,
        request: &MapRequest,
        required: usize,
    ) -> Result<MappedPtr, WglError> {
        if request.access.contains(MapAccess::PERSISTENT) {
            log::warn!(
                "MappingShim: persistent mapping of {:?} cannot be shadowed",
                request.key
            );
            abandon(driver, request.key);
            return Err(WglError::AddressUnrepresentable { size: required });
        }

        log::debug!(
            "MappingShim: shadowing {:?} with {} bytes",
            request.key,
            required
        );
        let mut shadow = ShadowBuffer::new(required);
        match driver.map_buffer(request, MapTransfer::CopyInto(shadow.as_mut_slice())) {
            MapOutcome::Mapped(ptr) => {
                self.shadows.insert(request.key, shadow);
                Ok(ptr)
            }
            MapOutcome::Unrepresentable { required } => {
                abandon(driver, request.key);
                Err(WglError::AddressUnrepresentable { size: required })
            }
            MapOutcome::Failed(error) => {
                abandon(driver, request.key);
                Err(error.into())
            }
        }
    }

    /// Unmap a buffer, writing a shadow back through the driver if one is active.
    pub fn unmap(&mut self, driver: &dyn Driver, key: BufferKey) -> Result<(), WglError> {
        let shadowed = self.shadows.get(&key).is_some_and(|shadow| {
            driver
                .mapped_pointer(key)
                .is_some_and(|ptr| ptr.addr() == shadow.addr())
        });
        if !shadowed && self.shadows.remove(&key).is_some() {
            log::debug!("MappingShim: dropping stale shadow of {:?}", key);
        }

        match driver.unmap_buffer(key, UnmapTransfer::Direct) {
            UnmapOutcome::Unmapped => {
                self.shadows.remove(&key);
                Ok(())
            }
            UnmapOutcome::Failed(error) => Err(error.into()),
            UnmapOutcome::Unrepresentable => {
                let Some(shadow) = self.shadows.remove(&key) else {
                    log::warn!("MappingShim: {:?} needs a copy-back but has no shadow", key);
                    return Err(WglError::AddressUnrepresentable { size: 0 });
                };
                match driver.unmap_buffer(key, UnmapTransfer::CopyBack(shadow.as_slice())) {
                    UnmapOutcome::Unmapped => {
                        log::trace!("MappingShim: released {}-byte shadow of {:?}", shadow.len(), key);
                        Ok(())
                    }
                    UnmapOutcome::Unrepresentable => Err(WglError::AddressUnrepresentable {
                        size: shadow.len(),
                    }),
                    UnmapOutcome::Failed(error) => Err(error.into()),
                }
            }
        }
    }
}

/// Drop a driver mapping whose shadow could not be set up.
fn abandon(driver: &dyn Driver, key: BufferKey) {
    if let UnmapOutcome::Failed(e) = driver.unmap_buffer(key, UnmapTransfer::Direct) {
        log::warn!("MappingShim: failed to drop mapping of {:?}: {}", key, e);
    }
}

thread_local! {
    static SHIMS: RefCell<HashMap<u64, MappingShim>> = RefCell::new(HashMap::new());
}

fn with_thread_shim<R>(instance: u64, f: impl FnOnce(&mut MappingShim) -> R) -> R {
    SHIMS.with(|shims| f(shims.borrow_mut().entry(instance).or_default()))
}

/// Drop the calling thread's shadows for `instance`.
pub(crate) fn discard_thread_shim(instance: u64) {
    // `try_with` since teardown may run during thread-local destruction.
    let _ = SHIMS.try_with(|shims| shims.borrow_mut().remove(&instance));
}

impl Wgl {
    /// Map a buffer in the calling thread's current context.
    ///
    /// With no current context the call goes to the [`NullDriver`](crate::NullDriver)
    /// and fails.
    pub fn map_buffer(&self, request: &MapRequest) -> Result<MappedPtr, WglError> {
        let driver = self.current_driver();
        with_thread_shim(self.id, |shim| shim.map(driver.as_ref(), request))
    }

    /// Unmap a buffer in the calling thread's current context.
    pub fn unmap_buffer(&self, key: BufferKey) -> Result<(), WglError> {
        let driver = self.current_driver();
        with_thread_shim(self.id, |shim| shim.unmap(driver.as_ref(), key))
    }

    /// Number of shadow buffers the calling thread holds for this instance.
    pub fn shadow_count(&self) -> usize {
        with_thread_shim(self.id, |shim| shim.shadow_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DeviceContext, DummyDriver};
    use crate::error::DriverError;

    fn bound_dummy(driver: DummyDriver) -> DummyDriver {
        let dc = DeviceContext(1);
        let ctx = driver.create_context(dc).unwrap();
        driver.make_current(Some(dc), Some(dc), Some(ctx)).unwrap();
        driver
    }

    #[test]
    fn test_shadow_buffer_layout() {
        assert_eq!(std::mem::size_of::<ShadowChunk>(), SHADOW_ALIGNMENT);
        assert_eq!(std::mem::align_of::<ShadowChunk>(), SHADOW_ALIGNMENT);
        for len in [0, 1, 15, 16, 17, 4096] {
            let mut shadow = ShadowBuffer::new(len);
            assert_eq!(shadow.addr() % SHADOW_ALIGNMENT, 0);
            assert_eq!(shadow.as_slice().len(), len);
            assert_eq!(shadow.as_mut_slice().len(), len);
            assert!(shadow.as_slice().iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_direct_map_passes_through() {
        let driver = bound_dummy(DummyDriver::new());
        let key = BufferKey::Target(1);
        driver.create_buffer(key, &[1; 8]);

        let mut shim = MappingShim::new();
        let ptr = shim
            .map(&driver, &MapRequest::whole(key, MapAccess::READ))
            .unwrap();
        assert_eq!(driver.mapped_pointer(key), Some(ptr));
        assert_eq!(shim.shadow_count(), 0);
        shim.unmap(&driver, key).unwrap();
        assert!(!driver.is_mapped(key));
    }

    #[test]
    fn test_unrepresentable_map_uses_shadow() {
        let driver = bound_dummy(DummyDriver::new().with_unrepresentable_mappings());
        let key = BufferKey::Named(2);
        driver.create_buffer(key, &[1, 2, 3, 4, 5]);

        let mut shim = MappingShim::new();
        let request = MapRequest::whole(key, MapAccess::READ | MapAccess::WRITE);
        let ptr = shim.map(&driver, &request).unwrap();
        assert_eq!(ptr.addr() % SHADOW_ALIGNMENT, 0);
        assert!(shim.is_shadowed(key));

        let mapped = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), 5) };
        assert_eq!(mapped, [1, 2, 3, 4, 5]);
        mapped[4] = 50;

        shim.unmap(&driver, key).unwrap();
        assert_eq!(shim.shadow_count(), 0);
        assert_eq!(driver.buffer_contents(key).unwrap(), [1, 2, 3, 4, 50]);
    }

    #[test]
    fn test_persistent_map_cannot_be_shadowed() {
        let driver = bound_dummy(DummyDriver::new().with_unrepresentable_mappings());
        let key = BufferKey::Named(3);
        driver.create_buffer(key, &[0; 32]);

        let mut shim = MappingShim::new();
        let request = MapRequest::whole(key, MapAccess::WRITE | MapAccess::PERSISTENT);
        assert_eq!(
            shim.map(&driver, &request),
            Err(WglError::AddressUnrepresentable { size: 32 })
        );
        assert_eq!(shim.shadow_count(), 0);
        assert!(!driver.is_mapped(key));
    }

    #[test]
    fn test_driver_failure_propagates() {
        let driver = bound_dummy(DummyDriver::new());
        let mut shim = MappingShim::new();
        let request = MapRequest::whole(BufferKey::Named(99), MapAccess::READ);
        assert!(matches!(
            shim.map(&driver, &request),
            Err(WglError::DriverFailure(DriverError::Failed(_)))
        ));
        assert_eq!(shim.shadow_count(), 0);
    }
}
