//! Current-context binding.
//!
//! A context is either unbound or current on exactly one thread. The owning
//! thread is recorded in the context's table slot; the calling thread keeps
//! only the handle value and the driver it dispatches to, so the slot stays
//! the single source of truth and is re-resolved on every operation.
//!
//! All transitions run under the handle table lock. A thread trying to bind
//! a context owned by another thread fails immediately with
//! [`WglError::Busy`]; nothing blocks waiting for the owner to let go.
//!
//! # Ordering
//!
//! On bind, the new context's driver is called first. Only after it succeeds
//! is the previously current context released, so a failed bind leaves the
//! thread exactly as it was.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crate::driver::{same_driver, DeviceContext, Driver, NullDriver};
use crate::error::WglError;
use crate::handle::{Handle, HandleType};
use crate::instance::Wgl;
use crate::table::{Entry, TableGuard};

/// What the calling thread has bound for one instance.
#[derive(Clone)]
pub(crate) struct ThreadBinding {
    pub(crate) context: Option<Handle>,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) draw: Option<DeviceContext>,
    pub(crate) read: Option<DeviceContext>,
}

thread_local! {
    static BINDINGS: RefCell<HashMap<u64, ThreadBinding>> = RefCell::new(HashMap::new());
}

/// Get the calling thread's binding for `instance`.
pub(crate) fn binding(instance: u64) -> Option<ThreadBinding> {
    BINDINGS.with(|bindings| bindings.borrow().get(&instance).cloned())
}

fn set_binding(instance: u64, binding: ThreadBinding) {
    BINDINGS.with(|bindings| {
        bindings.borrow_mut().insert(instance, binding);
    });
}

/// Forget the calling thread's binding for `instance`.
pub(crate) fn clear_binding(instance: u64) {
    let _ = BINDINGS.try_with(|bindings| bindings.borrow_mut().remove(&instance));
}

impl Wgl {
    /// Bind `context` to the calling thread, drawing to and reading from `dc`.
    ///
    /// Passing `None` as the context unbinds the thread's current context.
    pub fn make_current(
        &self,
        dc: Option<DeviceContext>,
        context: Option<Handle>,
    ) -> Result<(), WglError> {
        self.make_context_current(dc, dc, context)
    }

    /// Bind `context` to the calling thread with separate draw and read surfaces.
    ///
    /// Passing `None` as the context unbinds the thread's current context.
    /// Fails with [`WglError::Busy`] if the context is current on another
    /// thread, and with [`WglError::InvalidHandle`] when unbinding a thread
    /// that has nothing bound without naming a surface.
    pub fn make_context_current(
        &self,
        draw: Option<DeviceContext>,
        read: Option<DeviceContext>,
        context: Option<Handle>,
    ) -> Result<(), WglError> {
        let mut table = self.table.lock();
        self.bind_locked(&mut table, draw, read, context)
    }

    /// Get the context current on the calling thread.
    pub fn current_context(&self) -> Option<Handle> {
        binding(self.id).and_then(|b| b.context)
    }

    /// Get the draw surface of the calling thread's current context.
    pub fn current_dc(&self) -> Option<DeviceContext> {
        binding(self.id).and_then(|b| b.draw)
    }

    /// Get the read surface of the calling thread's current context.
    pub fn current_read_dc(&self) -> Option<DeviceContext> {
        binding(self.id).and_then(|b| b.read)
    }

    /// Get the driver the calling thread dispatches to.
    ///
    /// This is the [`NullDriver`] while no context is current.
    pub fn current_driver(&self) -> Arc<dyn Driver> {
        binding(self.id)
            .map(|b| b.driver)
            .unwrap_or_else(NullDriver::shared)
    }

    /// Delete a context.
    ///
    /// A context current on the calling thread is unbound first. Fails with
    /// [`WglError::Busy`] if the context is current on another thread. If
    /// the driver refuses the deletion the handle stays valid and is bound
    /// again to the surfaces it was current with.
    pub fn delete_context(&self, handle: Handle) -> Result<(), WglError> {
        let me = thread::current().id();
        let mut table = self.table.lock();

        let entry = table.get(handle, HandleType::Context)?;
        let context = entry.context()?;
        if context.owner.is_some_and(|owner| owner != me) {
            log::warn!("Wgl: cannot delete {:?}, current in another thread", handle);
            return Err(WglError::Busy);
        }
        let driver = Arc::clone(&entry.driver);
        let driver_context = context.driver_context;

        let mut restore = None;
        if self.current_context() == Some(handle) {
            restore = binding(self.id).map(|b| (b.draw, b.read));
            if let Err(e) = self.bind_locked(&mut table, None, None, None) {
                log::warn!("Wgl: unbinding {:?} before deletion failed: {}", handle, e);
                if let Ok(context) = table
                    .get_mut(handle, HandleType::Context)
                    .and_then(Entry::context_mut)
                {
                    context.unbind();
                }
                clear_binding(self.id);
            }
        }

        if let Err(e) = driver.delete_context(driver_context) {
            log::warn!("Wgl: driver refused to delete {:?}: {}", handle, e);
            if let Some((draw, read)) = restore {
                if let Err(rebind) = self.bind_context(&mut table, None, draw, read, handle) {
                    log::warn!("Wgl: rebinding {:?} failed: {}", handle, rebind);
                }
            }
            return Err(e.into());
        }
        table.release(handle, HandleType::Context)?;
        log::debug!("Wgl: deleted {:?}", handle);
        Ok(())
    }

    pub(crate) fn bind_locked(
        &self,
        table: &mut TableGuard<'_>,
        draw: Option<DeviceContext>,
        read: Option<DeviceContext>,
        context: Option<Handle>,
    ) -> Result<(), WglError> {
        let previous = binding(self.id);
        match context {
            Some(handle) => self.bind_context(table, previous, draw, read, handle),
            None => self.unbind_current(table, previous, draw.or(read)),
        }
    }

    fn bind_context(
        &self,
        table: &mut TableGuard<'_>,
        previous: Option<ThreadBinding>,
        draw: Option<DeviceContext>,
        read: Option<DeviceContext>,
        handle: Handle,
    ) -> Result<(), WglError> {
        let me = thread::current().id();

        let entry = table.get(handle, HandleType::Context)?;
        let context = entry.context()?;
        if context.owner.is_some_and(|owner| owner != me) {
            log::warn!("Wgl: {:?} is current in another thread", handle);
            return Err(WglError::Busy);
        }
        let driver = Arc::clone(&entry.driver);
        let driver_context = context.driver_context;

        driver.make_current(draw, read, Some(driver_context))?;

        if let Some(previous) = previous.filter(|p| p.context != Some(handle)) {
            if !same_driver(&previous.driver, &driver) {
                if let Err(e) = previous.driver.make_current(None, None, None) {
                    log::warn!(
                        "Wgl: {} driver failed to unbind {:?}: {}",
                        previous.driver.name(),
                        previous.context,
                        e
                    );
                }
            }
            if let Some(prev) = previous.context {
                if let Ok(context) = table
                    .get_mut(prev, HandleType::Context)
                    .and_then(Entry::context_mut)
                {
                    context.unbind();
                }
            }
        }

        table
            .get_mut(handle, HandleType::Context)
            .and_then(Entry::context_mut)?
            .bind(me, draw, read);
        set_binding(
            self.id,
            ThreadBinding {
                context: Some(handle),
                driver,
                draw,
                read,
            },
        );
        log::debug!("Wgl: bound {:?} on {:?}", handle, me);
        Ok(())
    }

    fn unbind_current(
        &self,
        table: &mut TableGuard<'_>,
        previous: Option<ThreadBinding>,
        dc: Option<DeviceContext>,
    ) -> Result<(), WglError> {
        let Some((handle, driver)) = previous.and_then(|p| p.context.map(|h| (h, p.driver))) else {
            return match dc {
                Some(_) => Ok(()),
                None => Err(WglError::InvalidHandle),
            };
        };

        driver.make_current(None, None, None)?;
        if let Ok(context) = table
            .get_mut(handle, HandleType::Context)
            .and_then(Entry::context_mut)
        {
            context.unbind();
        }
        clear_binding(self.id);
        log::debug!("Wgl: unbound {:?}", handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DummyDriver;
    use crate::params::WglParameters;

    const DC: DeviceContext = DeviceContext(1);

    fn setup() -> (Arc<DummyDriver>, Wgl) {
        let driver = Arc::new(DummyDriver::new());
        let wgl = Wgl::new(WglParameters::default());
        wgl.register_surface(DC, Arc::clone(&driver) as Arc<dyn Driver>);
        (driver, wgl)
    }

    #[test]
    fn test_bind_and_unbind() {
        let (driver, wgl) = setup();
        let ctx = wgl.create_context(DC).unwrap();

        wgl.make_current(Some(DC), Some(ctx)).unwrap();
        assert_eq!(wgl.current_context(), Some(ctx));
        assert_eq!(wgl.current_dc(), Some(DC));
        assert_eq!(wgl.current_driver().name(), "Dummy");
        assert!(driver.current_context().is_some());

        wgl.make_current(None, None).unwrap();
        assert_eq!(wgl.current_context(), None);
        assert_eq!(wgl.current_driver().name(), "Null");
        assert!(driver.current_context().is_none());
    }

    #[test]
    fn test_unbind_without_context_needs_surface() {
        let (_driver, wgl) = setup();
        assert_eq!(wgl.make_current(None, None), Err(WglError::InvalidHandle));
        assert_eq!(wgl.make_current(Some(DC), None), Ok(()));
        assert_eq!(wgl.make_context_current(None, Some(DC), None), Ok(()));
    }

    #[test]
    fn test_failed_bind_keeps_previous() {
        let (driver, wgl) = setup();
        let a = wgl.create_context(DC).unwrap();
        let b = wgl.create_context(DC).unwrap();
        wgl.make_current(Some(DC), Some(a)).unwrap();

        driver.fail_next_make_current(crate::error::DriverError::OutOfMemory);
        assert!(matches!(
            wgl.make_current(Some(DC), Some(b)),
            Err(WglError::DriverFailure(_))
        ));
        assert_eq!(wgl.current_context(), Some(a));
        let me = thread::current().id();
        let table = wgl.table.lock();
        assert_eq!(
            table.get(a, HandleType::Context).unwrap().context().unwrap().owner(),
            Some(me)
        );
        assert!(table
            .get(b, HandleType::Context)
            .unwrap()
            .context()
            .unwrap()
            .owner()
            .is_none());
    }

    #[test]
    fn test_switching_releases_previous() {
        let (_driver, wgl) = setup();
        let a = wgl.create_context(DC).unwrap();
        let b = wgl.create_context(DC).unwrap();

        wgl.make_current(Some(DC), Some(a)).unwrap();
        wgl.make_current(Some(DC), Some(b)).unwrap();
        assert_eq!(wgl.current_context(), Some(b));

        let table = wgl.table.lock();
        let owner = |h| {
            table
                .get(h, HandleType::Context)
                .unwrap()
                .context()
                .unwrap()
                .owner()
        };
        assert!(owner(a).is_none());
        assert!(owner(b).is_some());
    }

    #[test]
    fn test_delete_current_context() {
        let (driver, wgl) = setup();
        let ctx = wgl.create_context(DC).unwrap();
        wgl.make_current(Some(DC), Some(ctx)).unwrap();

        wgl.delete_context(ctx).unwrap();
        assert_eq!(wgl.current_context(), None);
        assert_eq!(driver.live_contexts(), 0);
        assert_eq!(wgl.delete_context(ctx), Err(WglError::InvalidHandle));
    }

    #[test]
    fn test_refused_delete_keeps_context() {
        let (driver, wgl) = setup();
        let ctx = wgl.create_context(DC).unwrap();

        driver.fail_next_delete(crate::error::DriverError::Failed("in use".into()));
        assert!(wgl.delete_context(ctx).is_err());
        assert!(wgl.table.resolve(ctx, HandleType::Context).is_ok());
        wgl.delete_context(ctx).unwrap();
    }

    #[test]
    fn test_refused_delete_keeps_current_binding() {
        let (driver, wgl) = setup();
        let ctx = wgl.create_context(DC).unwrap();
        wgl.make_current(Some(DC), Some(ctx)).unwrap();

        driver.fail_next_delete(crate::error::DriverError::Failed("in use".into()));
        assert!(wgl.delete_context(ctx).is_err());
        assert_eq!(wgl.current_context(), Some(ctx));
        assert_eq!(wgl.current_dc(), Some(DC));
        assert!(driver.current_context().is_some());
        {
            let table = wgl.table.lock();
            let owner = table
                .get(ctx, HandleType::Context)
                .unwrap()
                .context()
                .unwrap()
                .owner();
            assert_eq!(owner, Some(thread::current().id()));
        }

        wgl.delete_context(ctx).unwrap();
        assert_eq!(wgl.current_context(), None);
        assert_eq!(driver.live_contexts(), 0);
    }

    #[test]
    fn test_pbuffer_handle_is_not_a_context() {
        let (_driver, wgl) = setup();
        let pbuffer = wgl.create_pbuffer(DC, 1, 16, 16).unwrap();
        assert_eq!(
            wgl.make_current(Some(DC), Some(pbuffer)),
            Err(WglError::InvalidHandle)
        );
        assert_eq!(wgl.delete_context(pbuffer), Err(WglError::InvalidHandle));
    }
}
