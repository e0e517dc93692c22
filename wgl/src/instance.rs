//! The WGL instance.
//!
//! A [`Wgl`] owns one handle table, the surface registry that says which
//! driver serves which [`DeviceContext`], and its [`WglParameters`]. The
//! process-wide instance behind [`Wgl::global`] is created on first use from
//! the environment and lives until process exit; call [`Wgl::teardown`]
//! to destroy its driver objects earlier. Instances made with [`Wgl::new`]
//! tear down when dropped.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use redlilium_wgl::{DeviceContext, Driver, DummyDriver, Wgl, WglParameters};
//!
//! let wgl = Wgl::new(WglParameters::default());
//! let dc = DeviceContext(1);
//! wgl.register_surface(dc, Arc::new(DummyDriver::new()) as Arc<dyn Driver>);
//!
//! let ctx = wgl.create_context(dc).unwrap();
//! wgl.make_current(Some(dc), Some(ctx)).unwrap();
//! assert_eq!(wgl.current_context(), Some(ctx));
//! wgl.delete_context(ctx).unwrap();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::context::ContextPayload;
use crate::current;
use crate::driver::{
    same_driver, ContextAttrib, DeviceContext, Driver, DriverContext, NarrowAddressDriver,
    PbufferAttribute,
};
use crate::error::WglError;
use crate::extensions::{ExtensionFilter, ExtensionList};
use crate::handle::{Handle, HandleType};
use crate::mapping;
use crate::params::WglParameters;
use crate::table::{HandleTable, SlotPayload, TableGuard};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Wgl> = OnceLock::new();

#[derive(Default)]
struct SurfaceRegistry {
    by_dc: HashMap<DeviceContext, Arc<dyn Driver>>,
    /// Narrow adapters keyed by the address of the driver they wrap.
    adapters: HashMap<usize, Arc<dyn Driver>>,
}

/// Context and pbuffer management for one set of drivers.
pub struct Wgl {
    pub(crate) id: u64,
    pub(crate) table: Arc<HandleTable>,
    params: WglParameters,
    filter: ExtensionFilter,
    surfaces: RwLock<SurfaceRegistry>,
}

impl Wgl {
    /// Create a new instance.
    pub fn new(params: WglParameters) -> Self {
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Wgl: instance {} with {} handle slots for {}-bit callers",
            id,
            params.capacity,
            params.pointer_width.bits()
        );
        Self {
            id,
            table: Arc::new(HandleTable::new(params.capacity)),
            filter: ExtensionFilter::new(&params),
            params,
            surfaces: RwLock::new(SurfaceRegistry::default()),
        }
    }

    /// Get the process-wide instance, creating it from the environment on first use.
    pub fn global() -> &'static Wgl {
        GLOBAL.get_or_init(|| Wgl::new(WglParameters::from_env()))
    }

    /// Get the instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the instance parameters.
    pub fn params(&self) -> &WglParameters {
        &self.params
    }

    /// Get the handle table.
    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    /// Associate a surface with the driver that serves it.
    ///
    /// For narrow callers the driver is wrapped in a [`NarrowAddressDriver`],
    /// shared by every surface the same driver serves.
    pub fn register_surface(&self, dc: DeviceContext, driver: Arc<dyn Driver>) {
        let mut surfaces = self.surfaces.write();
        let driver = if self.params.pointer_width.is_narrow() {
            let key = Arc::as_ptr(&driver).cast::<()>() as usize;
            let width = self.params.pointer_width;
            Arc::clone(
                surfaces
                    .adapters
                    .entry(key)
                    .or_insert_with(|| Arc::new(NarrowAddressDriver::new(driver, width))),
            )
        } else {
            driver
        };
        log::debug!("Wgl: {:?} served by {} driver", dc, driver.name());
        surfaces.by_dc.insert(dc, driver);
    }

    /// Forget a surface. Returns whether it was registered.
    pub fn unregister_surface(&self, dc: DeviceContext) -> bool {
        self.surfaces.write().by_dc.remove(&dc).is_some()
    }

    /// Get the driver serving a surface.
    pub fn surface_driver(&self, dc: DeviceContext) -> Result<Arc<dyn Driver>, WglError> {
        self.surfaces
            .read()
            .by_dc
            .get(&dc)
            .cloned()
            .ok_or(WglError::InvalidHandle)
    }

    /// Create a context on a surface.
    pub fn create_context(&self, dc: DeviceContext) -> Result<Handle, WglError> {
        let driver = self.surface_driver(dc)?;
        let mut table = self.table.lock();
        let driver_context = driver.create_context(dc)?;
        self.store_context(&mut table, HandleType::Context, driver, driver_context)
    }

    /// Create a context from an attribute list, optionally sharing objects with `share`.
    ///
    /// Requesting major version 3 or later yields a [`HandleType::ContextV3`] handle.
    pub fn create_context_attribs(
        &self,
        dc: DeviceContext,
        share: Option<Handle>,
        attribs: &[ContextAttrib],
    ) -> Result<Handle, WglError> {
        let driver = self.surface_driver(dc)?;
        let mut table = self.table.lock();
        let share_context = match share {
            Some(handle) => Some(table.get(handle, HandleType::Context)?.context()?.driver_context),
            None => None,
        };
        let driver_context = driver.create_context_attribs(dc, share_context, attribs)?;
        let ty = if ContextAttrib::requests_v3(attribs) {
            HandleType::ContextV3
        } else {
            HandleType::Context
        };
        self.store_context(&mut table, ty, driver, driver_context)
    }

    fn store_context(
        &self,
        table: &mut TableGuard<'_>,
        ty: HandleType,
        driver: Arc<dyn Driver>,
        driver_context: DriverContext,
    ) -> Result<Handle, WglError> {
        let extensions = self.filter.apply(driver.extensions().as_slice());
        let payload = SlotPayload::Context(Box::new(ContextPayload::new(driver_context, extensions)));
        match table.allocate(ty, Arc::clone(&driver), payload) {
            Ok(handle) => {
                log::debug!("Wgl: created {:?} on {} driver", handle, driver.name());
                Ok(handle)
            }
            Err(err) => {
                if let Err(e) = driver.delete_context(driver_context) {
                    log::warn!("Wgl: failed to destroy unstored {:?}: {}", driver_context, e);
                }
                Err(err)
            }
        }
    }

    /// Get the driver-side context behind a handle.
    pub fn driver_context(&self, handle: Handle) -> Result<DriverContext, WglError> {
        let slot = self.table.resolve(handle, HandleType::Context)?;
        Ok(slot.context()?.driver_context())
    }

    /// Copy state selected by `mask` from `src` to `dst`.
    ///
    /// Both contexts must belong to the same driver.
    pub fn copy_context(&self, src: Handle, dst: Handle, mask: u32) -> Result<(), WglError> {
        let table = self.table.lock();
        let source = table.get(src, HandleType::Context)?;
        let target = table.get(dst, HandleType::Context)?;
        if !same_driver(&source.driver, &target.driver) {
            return Err(WglError::InvalidHandle);
        }
        source.driver.copy_context(
            source.context()?.driver_context,
            target.context()?.driver_context,
            mask,
        )?;
        Ok(())
    }

    /// Share object namespaces between two contexts of the same driver.
    pub fn share_lists(&self, src: Handle, dst: Handle) -> Result<(), WglError> {
        let table = self.table.lock();
        let source = table.get(src, HandleType::Context)?;
        let target = table.get(dst, HandleType::Context)?;
        if !same_driver(&source.driver, &target.driver) {
            return Err(WglError::InvalidHandle);
        }
        source.driver.share_lists(
            source.context()?.driver_context,
            target.context()?.driver_context,
        )?;
        Ok(())
    }

    /// Get the extensions of the calling thread's current context.
    pub fn extensions(&self) -> Result<ExtensionList, WglError> {
        let handle = self.current_context().ok_or(WglError::InvalidHandle)?;
        let slot = self.table.resolve(handle, HandleType::Context)?;
        Ok(slot.context()?.extensions().clone())
    }

    /// Create an off-screen pbuffer compatible with a surface.
    pub fn create_pbuffer(
        &self,
        dc: DeviceContext,
        format: i32,
        width: i32,
        height: i32,
    ) -> Result<Handle, WglError> {
        let driver = self.surface_driver(dc)?;
        let mut table = self.table.lock();
        let pbuffer = driver.create_pbuffer(dc, format, width, height)?;
        match table.allocate(
            HandleType::Pbuffer,
            Arc::clone(&driver),
            SlotPayload::Pbuffer(pbuffer),
        ) {
            Ok(handle) => {
                log::debug!("Wgl: created {:?} ({}x{})", handle, width, height);
                Ok(handle)
            }
            Err(err) => {
                if let Err(e) = driver.destroy_pbuffer(pbuffer) {
                    log::warn!("Wgl: failed to destroy unstored {:?}: {}", pbuffer, e);
                }
                Err(err)
            }
        }
    }

    /// Destroy a pbuffer.
    ///
    /// If the driver refuses, the handle stays valid.
    pub fn destroy_pbuffer(&self, handle: Handle) -> Result<(), WglError> {
        let slot = self.table.resolve(handle, HandleType::Pbuffer)?;
        slot.driver.destroy_pbuffer(slot.pbuffer()?)?;
        slot.release();
        log::debug!("Wgl: destroyed {:?}", handle);
        Ok(())
    }

    /// Get a surface for drawing into a pbuffer.
    ///
    /// The surface is registered with the pbuffer's driver until released.
    pub fn pbuffer_dc(&self, handle: Handle) -> Result<DeviceContext, WglError> {
        let slot = self.table.resolve(handle, HandleType::Pbuffer)?;
        let dc = slot.driver.pbuffer_dc(slot.pbuffer()?)?;
        self.surfaces
            .write()
            .by_dc
            .insert(dc, Arc::clone(&slot.driver));
        Ok(dc)
    }

    /// Release a surface obtained from [`pbuffer_dc`](Self::pbuffer_dc).
    pub fn release_pbuffer_dc(&self, handle: Handle, dc: DeviceContext) -> Result<(), WglError> {
        let slot = self.table.resolve(handle, HandleType::Pbuffer)?;
        slot.driver.release_pbuffer_dc(slot.pbuffer()?, dc)?;
        self.surfaces.write().by_dc.remove(&dc);
        Ok(())
    }

    /// Query a pbuffer attribute.
    pub fn query_pbuffer(&self, handle: Handle, attrib: PbufferAttribute) -> Result<i32, WglError> {
        let slot = self.table.resolve(handle, HandleType::Pbuffer)?;
        Ok(slot.driver.query_pbuffer(slot.pbuffer()?, attrib)?)
    }

    /// Destroy every remaining context and pbuffer.
    ///
    /// Driver failures are logged and skipped. Every handle is invalid afterwards.
    pub fn teardown(&self) {
        let entries = self.table.lock().drain();
        if !entries.is_empty() {
            log::info!("Wgl: tearing down {} live handles", entries.len());
        }
        for entry in entries {
            let result = match entry.payload {
                SlotPayload::Context(context) => entry.driver.delete_context(context.driver_context),
                SlotPayload::Pbuffer(pbuffer) => entry.driver.destroy_pbuffer(pbuffer),
            };
            if let Err(e) = result {
                log::error!("Wgl: failed to destroy {:?} during teardown: {}", entry.handle, e);
            }
        }
        current::clear_binding(self.id);
        mapping::discard_thread_shim(self.id);
    }
}

impl Drop for Wgl {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Wgl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wgl")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("surfaces", &self.surfaces.read().by_dc.len())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Wgl: Send, Sync);
