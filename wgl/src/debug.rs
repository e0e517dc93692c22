//! Debug message forwarding.
//!
//! Callers register a [`DebugCallback`] per context. The driver never sees
//! it: it is given a trampoline [`DebugSink`] instead, which looks up the
//! callback on the context current in the emitting thread and calls it with
//! the caller's own user data.
//!
//! The trampoline holds only a weak reference to the handle table, so a
//! driver that outlives its [`Wgl`] instance keeps a sink that silently
//! does nothing.

use std::sync::{Arc, Weak};

use crate::current;
use crate::driver::{DebugMessage, DebugSink};
use crate::error::WglError;
use crate::handle::{Handle, HandleType};
use crate::instance::Wgl;
use crate::table::{self, HandleTable};

/// Opaque value passed back to a debug callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DebugUserData(pub usize);

/// Caller-supplied debug callback.
pub type DebugCallback = Arc<dyn Fn(&DebugMessage<'_>, DebugUserData) + Send + Sync>;

/// A callback registered on a context.
#[derive(Clone)]
pub struct DebugRegistration {
    callback: DebugCallback,
    user_data: DebugUserData,
}

impl DebugRegistration {
    /// Get the user data passed to the callback.
    pub fn user_data(&self) -> DebugUserData {
        self.user_data
    }

    /// Invoke the callback.
    pub fn invoke(&self, message: &DebugMessage<'_>) {
        (self.callback)(message, self.user_data);
    }
}

impl std::fmt::Debug for DebugRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugRegistration")
            .field("user_data", &self.user_data)
            .finish_non_exhaustive()
    }
}

impl Wgl {
    /// Register a debug callback on the calling thread's current context.
    ///
    /// Passing `None` removes the callback.
    pub fn debug_message_callback(
        &self,
        callback: Option<DebugCallback>,
        user_data: DebugUserData,
    ) -> Result<(), WglError> {
        let handle = self.current_context().ok_or(WglError::InvalidHandle)?;
        self.set_debug_callback(handle, callback, user_data)
    }

    /// Register a debug callback on a context.
    ///
    /// Passing `None` removes the callback.
    pub fn set_debug_callback(
        &self,
        handle: Handle,
        callback: Option<DebugCallback>,
        user_data: DebugUserData,
    ) -> Result<(), WglError> {
        let mut table = self.table.lock();
        let entry = table.get_mut(handle, HandleType::Context)?;
        let driver = Arc::clone(&entry.driver);
        let context = entry.context_mut()?;

        let sink = callback
            .as_ref()
            .map(|_| trampoline(Arc::downgrade(&self.table), self.id));
        driver.set_debug_sink(context.driver_context, sink)?;
        context.debug = callback.map(|callback| DebugRegistration {
            callback,
            user_data,
        });
        log::debug!("Wgl: debug callback on {:?} updated", handle);
        Ok(())
    }
}

fn trampoline(table: Weak<HandleTable>, instance: u64) -> DebugSink {
    Arc::new(move |message: &DebugMessage<'_>| deliver(&table, instance, message))
}

fn deliver(table: &Weak<HandleTable>, instance: u64, message: &DebugMessage<'_>) {
    let Some(handles) = table.upgrade() else {
        return;
    };
    if table::lock_held() {
        log::warn!(
            "Dropping debug message emitted during a WGL call: {}",
            message.text
        );
        return;
    }
    let Some(handle) = current::binding(instance).and_then(|b| b.context) else {
        log::warn!(
            "Dropping debug message from a thread without a current context: {}",
            message.text
        );
        return;
    };
    if let Some(registration) = registration(&handles, handle) {
        registration.invoke(message);
    }
}

fn registration(table: &HandleTable, handle: Handle) -> Option<DebugRegistration> {
    let guard = table.lock();
    let context = guard.get(handle, HandleType::Context).ok()?.context().ok()?;
    context.debug.clone()
}
