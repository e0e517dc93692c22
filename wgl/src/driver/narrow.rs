//! Narrow address adapter.
//!
//! Wraps a driver whose mappings live in a wider address space than the
//! caller can express. Mappings that happen to fit are passed through; the
//! rest are reported as [`MapOutcome::Unrepresentable`] and served through the
//! copy protocol, with the adapter copying between the driver's mapping and
//! the caller's region.
//!
//! One adapter serves every context of its driver, and a target key names a
//! different buffer in each thread's current context, so pending and
//! shadowed mappings are tracked per calling thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use super::{
    BufferKey, ContextAttrib, DebugSink, DeviceContext, Driver, DriverContext, DriverPbuffer,
    MapAccess, MapOutcome, MapRequest, MapTransfer, MappedPtr, PbufferAttribute, UnmapOutcome,
    UnmapTransfer,
};
use crate::error::DriverError;

/// Width in bits of the addresses a caller can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointerWidth(u32);

impl PointerWidth {
    /// Width of the host's own pointers.
    pub const NATIVE: Self = Self(usize::BITS);

    /// 32-bit callers.
    pub const BITS_32: Self = Self(32);

    /// Create a pointer width, clamped to `1..=usize::BITS`.
    pub fn new(bits: u32) -> Self {
        Self(bits.clamp(1, usize::BITS))
    }

    /// Get the width in bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether this is narrower than the host's pointers.
    pub fn is_narrow(self) -> bool {
        self.0 < usize::BITS
    }

    /// Whether `[addr, addr + len)` is addressable at this width.
    pub fn fits(self, addr: usize, len: usize) -> bool {
        if !self.is_narrow() {
            return true;
        }
        let limit = 1u128 << self.0;
        (addr as u128) + (len as u128) <= limit
    }
}

impl Default for PointerWidth {
    fn default() -> Self {
        Self::NATIVE
    }
}

/// Thread that made the mapping and the buffer it names there.
type MappingKey = (ThreadId, BufferKey);

fn mapping_key(key: BufferKey) -> MappingKey {
    (thread::current().id(), key)
}

/// A driver mapping served through a caller-owned region.
struct ShadowedMapping {
    wide: MappedPtr,
    length: usize,
    access: MapAccess,
    region: Option<MappedPtr>,
}

/// Adapter serving narrow callers from a wide driver.
pub struct NarrowAddressDriver {
    inner: Arc<dyn Driver>,
    width: PointerWidth,
    shadowed: Mutex<HashMap<MappingKey, ShadowedMapping>>,
}

impl NarrowAddressDriver {
    /// Wrap `inner` for callers limited to `width`.
    pub fn new(inner: Arc<dyn Driver>, width: PointerWidth) -> Self {
        Self {
            inner,
            width,
            shadowed: Mutex::new(HashMap::new()),
        }
    }

    /// Get the wrapped driver.
    pub fn inner(&self) -> &Arc<dyn Driver> {
        &self.inner
    }

    /// Get the caller pointer width.
    pub fn width(&self) -> PointerWidth {
        self.width
    }

    fn map_direct(&self, request: &MapRequest) -> MapOutcome {
        let ptr = match self.inner.map_buffer(request, MapTransfer::Direct) {
            MapOutcome::Mapped(ptr) => ptr,
            other => return other,
        };

        let length = match request.length {
            Some(length) => length,
            None => match self.inner.buffer_size(request.key) {
                Ok(size) => size.saturating_sub(request.offset),
                Err(error) => {
                    let _ = self.inner.unmap_buffer(request.key, UnmapTransfer::Direct);
                    return MapOutcome::Failed(error);
                }
            },
        };

        if self.width.fits(ptr.addr(), length) {
            return MapOutcome::Mapped(ptr);
        }

        log::debug!(
            "NarrowAddressDriver: {:?} mapped at {:?} is beyond {} bits",
            request.key,
            ptr,
            self.width.bits()
        );
        self.shadowed.lock().insert(
            mapping_key(request.key),
            ShadowedMapping {
                wide: ptr,
                length,
                access: request.access,
                region: None,
            },
        );
        MapOutcome::Unrepresentable { required: length }
    }

    fn map_copy(&self, request: &MapRequest, region: &mut [u8]) -> MapOutcome {
        let mut shadowed = self.shadowed.lock();
        let Some(mapping) = shadowed.get_mut(&mapping_key(request.key)) else {
            return MapOutcome::Failed(DriverError::Failed(format!(
                "{:?} has no pending mapping",
                request.key
            )));
        };
        if region.len() < mapping.length {
            return MapOutcome::Failed(DriverError::Failed(format!(
                "copy region of {} bytes is smaller than the {}-byte mapping",
                region.len(),
                mapping.length
            )));
        }
        if !mapping.access.discards_contents() {
            // SAFETY: the inner driver keeps `wide` mapped for `length` bytes
            // until the buffer is unmapped, which only this adapter does.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    mapping.wide.as_ptr(),
                    region.as_mut_ptr(),
                    mapping.length,
                );
            }
        }
        let ptr = MappedPtr::from_slice(region);
        mapping.region = Some(ptr);
        MapOutcome::Mapped(ptr)
    }
}

impl std::fmt::Debug for NarrowAddressDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NarrowAddressDriver")
            .field("inner", &self.inner)
            .field("width", &self.width.bits())
            .field("shadowed", &self.shadowed.lock().len())
            .finish()
    }
}

impl Driver for NarrowAddressDriver {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn create_context(&self, dc: DeviceContext) -> Result<DriverContext, DriverError> {
        self.inner.create_context(dc)
    }

    fn create_context_attribs(
        &self,
        dc: DeviceContext,
        share: Option<DriverContext>,
        attribs: &[ContextAttrib],
    ) -> Result<DriverContext, DriverError> {
        self.inner.create_context_attribs(dc, share, attribs)
    }

    fn delete_context(&self, ctx: DriverContext) -> Result<(), DriverError> {
        self.inner.delete_context(ctx)
    }

    fn make_current(
        &self,
        draw: Option<DeviceContext>,
        read: Option<DeviceContext>,
        ctx: Option<DriverContext>,
    ) -> Result<(), DriverError> {
        self.inner.make_current(draw, read, ctx)
    }

    fn copy_context(
        &self,
        src: DriverContext,
        dst: DriverContext,
        mask: u32,
    ) -> Result<(), DriverError> {
        self.inner.copy_context(src, dst, mask)
    }

    fn share_lists(&self, src: DriverContext, dst: DriverContext) -> Result<(), DriverError> {
        self.inner.share_lists(src, dst)
    }

    fn create_pbuffer(
        &self,
        dc: DeviceContext,
        format: i32,
        width: i32,
        height: i32,
    ) -> Result<DriverPbuffer, DriverError> {
        self.inner.create_pbuffer(dc, format, width, height)
    }

    fn destroy_pbuffer(&self, pbuffer: DriverPbuffer) -> Result<(), DriverError> {
        self.inner.destroy_pbuffer(pbuffer)
    }

    fn pbuffer_dc(&self, pbuffer: DriverPbuffer) -> Result<DeviceContext, DriverError> {
        self.inner.pbuffer_dc(pbuffer)
    }

    fn release_pbuffer_dc(
        &self,
        pbuffer: DriverPbuffer,
        dc: DeviceContext,
    ) -> Result<(), DriverError> {
        self.inner.release_pbuffer_dc(pbuffer, dc)
    }

    fn query_pbuffer(
        &self,
        pbuffer: DriverPbuffer,
        attrib: PbufferAttribute,
    ) -> Result<i32, DriverError> {
        self.inner.query_pbuffer(pbuffer, attrib)
    }

    fn map_buffer(&self, request: &MapRequest, transfer: MapTransfer<'_>) -> MapOutcome {
        match transfer {
            MapTransfer::Direct => self.map_direct(request),
            MapTransfer::CopyInto(region) => self.map_copy(request, region),
        }
    }

    fn unmap_buffer(&self, key: BufferKey, transfer: UnmapTransfer<'_>) -> UnmapOutcome {
        let slot = mapping_key(key);
        let mut shadowed = self.shadowed.lock();
        let Some(mapping) = shadowed.remove(&slot) else {
            drop(shadowed);
            return self.inner.unmap_buffer(key, transfer);
        };

        match transfer {
            // Copy retry never happened, nothing to write back.
            UnmapTransfer::Direct if mapping.region.is_none() => {
                drop(shadowed);
                self.inner.unmap_buffer(key, UnmapTransfer::Direct)
            }
            UnmapTransfer::Direct => {
                shadowed.insert(slot, mapping);
                UnmapOutcome::Unrepresentable
            }
            UnmapTransfer::CopyBack(region) => {
                drop(shadowed);
                if mapping.access.contains(MapAccess::WRITE) {
                    let Some(source) = region.get(..mapping.length) else {
                        self.shadowed.lock().insert(slot, mapping);
                        return UnmapOutcome::Failed(DriverError::Failed(
                            "copy-back region is shorter than the mapping".into(),
                        ));
                    };
                    // SAFETY: `wide` is still mapped for `length` bytes; the
                    // inner unmap below is what releases it.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            source.as_ptr(),
                            mapping.wide.as_ptr(),
                            mapping.length,
                        );
                    }
                }
                self.inner.unmap_buffer(key, UnmapTransfer::Direct)
            }
        }
    }

    fn mapped_pointer(&self, key: BufferKey) -> Option<MappedPtr> {
        match self.shadowed.lock().get(&mapping_key(key)) {
            Some(mapping) => mapping.region,
            None => self.inner.mapped_pointer(key),
        }
    }

    fn buffer_size(&self, key: BufferKey) -> Result<usize, DriverError> {
        self.inner.buffer_size(key)
    }

    fn set_debug_sink(&self, ctx: DriverContext, sink: Option<DebugSink>) -> Result<(), DriverError> {
        self.inner.set_debug_sink(ctx, sink)
    }

    fn extensions(&self) -> Vec<String> {
        self.inner.extensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DummyDriver;

    const DC: DeviceContext = DeviceContext(1);

    /// A width no heap address fits in.
    fn tiny() -> PointerWidth {
        PointerWidth::new(1)
    }

    fn setup(width: PointerWidth) -> (Arc<DummyDriver>, NarrowAddressDriver) {
        let dummy = Arc::new(DummyDriver::new());
        let narrow = NarrowAddressDriver::new(Arc::clone(&dummy) as Arc<dyn Driver>, width);
        let ctx = narrow.create_context(DC).unwrap();
        narrow.make_current(Some(DC), Some(DC), Some(ctx)).unwrap();
        (dummy, narrow)
    }

    #[test]
    fn test_pointer_width() {
        assert!(!PointerWidth::NATIVE.is_narrow());
        assert!(PointerWidth::NATIVE.fits(usize::MAX, 0));
        assert_eq!(PointerWidth::new(0).bits(), 1);
        assert_eq!(PointerWidth::new(1000).bits(), usize::BITS);

        let width = PointerWidth::new(16);
        assert!(width.fits(0xff00, 0x100));
        assert!(!width.fits(0xff00, 0x101));
    }

    #[test]
    fn test_fitting_mapping_passes_through() {
        let (dummy, narrow) = setup(PointerWidth::NATIVE);
        let key = BufferKey::Named(1);
        dummy.create_buffer(key, &[5; 16]);

        let request = MapRequest::whole(key, MapAccess::READ);
        assert!(matches!(
            narrow.map_buffer(&request, MapTransfer::Direct),
            MapOutcome::Mapped(_)
        ));
        assert_eq!(narrow.unmap_buffer(key, UnmapTransfer::Direct), UnmapOutcome::Unmapped);
    }

    #[test]
    fn test_wide_mapping_is_copied() {
        let (dummy, narrow) = setup(tiny());
        let key = BufferKey::Target(0x8892);
        dummy.create_buffer(key, &[1, 2, 3, 4, 5, 6]);

        let request = MapRequest::range(key, 2, 3, MapAccess::READ | MapAccess::WRITE);
        assert_eq!(
            narrow.map_buffer(&request, MapTransfer::Direct),
            MapOutcome::Unrepresentable { required: 3 }
        );

        let mut region = vec![0u8; 3];
        let MapOutcome::Mapped(ptr) = narrow.map_buffer(&request, MapTransfer::CopyInto(&mut region))
        else {
            panic!("copy retry failed");
        };
        assert_eq!(narrow.mapped_pointer(key), Some(ptr));
        assert_eq!(region, [3, 4, 5]);

        region.copy_from_slice(&[7, 7, 7]);
        assert_eq!(
            narrow.unmap_buffer(key, UnmapTransfer::Direct),
            UnmapOutcome::Unrepresentable
        );
        assert_eq!(
            narrow.unmap_buffer(key, UnmapTransfer::CopyBack(&region)),
            UnmapOutcome::Unmapped
        );
        assert_eq!(dummy.buffer_contents(key).unwrap(), [1, 2, 7, 7, 7, 6]);
        assert!(!dummy.is_mapped(key));
    }

    #[test]
    fn test_invalidating_map_skips_copy_in() {
        let (dummy, narrow) = setup(tiny());
        let key = BufferKey::Named(4);
        dummy.create_buffer(key, &[9; 4]);

        let request = MapRequest::whole(key, MapAccess::WRITE | MapAccess::INVALIDATE_BUFFER);
        assert_eq!(
            narrow.map_buffer(&request, MapTransfer::Direct),
            MapOutcome::Unrepresentable { required: 4 }
        );
        let mut region = vec![0u8; 4];
        assert!(matches!(
            narrow.map_buffer(&request, MapTransfer::CopyInto(&mut region)),
            MapOutcome::Mapped(_)
        ));
        assert_eq!(region, [0; 4]);
    }

    #[test]
    fn test_read_only_unmap_does_not_write_back() {
        let (dummy, narrow) = setup(tiny());
        let key = BufferKey::Named(5);
        dummy.create_buffer(key, &[1; 4]);

        let request = MapRequest::whole(key, MapAccess::READ);
        let _ = narrow.map_buffer(&request, MapTransfer::Direct);
        let mut region = vec![0u8; 4];
        let _ = narrow.map_buffer(&request, MapTransfer::CopyInto(&mut region));
        region.fill(8);
        assert_eq!(
            narrow.unmap_buffer(key, UnmapTransfer::CopyBack(&region)),
            UnmapOutcome::Unmapped
        );
        assert_eq!(dummy.buffer_contents(key).unwrap(), [1; 4]);
    }

    #[test]
    fn test_abandoned_copy_unmaps_directly() {
        let (dummy, narrow) = setup(tiny());
        let key = BufferKey::Named(6);
        dummy.create_buffer(key, &[0; 4]);

        let request = MapRequest::whole(key, MapAccess::READ);
        let _ = narrow.map_buffer(&request, MapTransfer::Direct);
        assert!(dummy.is_mapped(key));
        assert_eq!(narrow.unmap_buffer(key, UnmapTransfer::Direct), UnmapOutcome::Unmapped);
        assert!(!dummy.is_mapped(key));
    }

    static_assertions::assert_impl_all!(NarrowAddressDriver: Send, Sync);
}
