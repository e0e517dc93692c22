//! Per-context bookkeeping stored in the handle table.

use std::thread::ThreadId;

use crate::debug::DebugRegistration;
use crate::driver::{DeviceContext, DriverContext};
use crate::extensions::ExtensionList;

/// What the table keeps for a rendering context.
pub struct ContextPayload {
    pub(crate) driver_context: DriverContext,
    /// Thread the context is current on.
    pub(crate) owner: Option<ThreadId>,
    pub(crate) draw: Option<DeviceContext>,
    pub(crate) read: Option<DeviceContext>,
    pub(crate) debug: Option<DebugRegistration>,
    pub(crate) extensions: ExtensionList,
}

impl ContextPayload {
    /// Create bookkeeping for a freshly created, unbound context.
    pub fn new(driver_context: DriverContext, extensions: ExtensionList) -> Self {
        Self {
            driver_context,
            owner: None,
            draw: None,
            read: None,
            debug: None,
            extensions,
        }
    }

    /// Get the driver-side context.
    pub fn driver_context(&self) -> DriverContext {
        self.driver_context
    }

    /// Get the thread the context is current on.
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Get the draw surface of the last successful bind.
    pub fn draw(&self) -> Option<DeviceContext> {
        self.draw
    }

    /// Get the read surface of the last successful bind.
    pub fn read(&self) -> Option<DeviceContext> {
        self.read
    }

    /// Get the registered debug callback.
    pub fn debug(&self) -> Option<&DebugRegistration> {
        self.debug.as_ref()
    }

    /// Get the extension lists.
    pub fn extensions(&self) -> &ExtensionList {
        &self.extensions
    }

    pub(crate) fn bind(
        &mut self,
        owner: ThreadId,
        draw: Option<DeviceContext>,
        read: Option<DeviceContext>,
    ) {
        self.owner = Some(owner);
        self.draw = draw;
        self.read = read;
    }

    pub(crate) fn unbind(&mut self) {
        self.owner = None;
        self.draw = None;
        self.read = None;
    }
}

impl std::fmt::Debug for ContextPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPayload")
            .field("driver_context", &self.driver_context)
            .field("owner", &self.owner)
            .field("draw", &self.draw)
            .field("read", &self.read)
            .field("debug", &self.debug.is_some())
            .field("extensions", &self.extensions.enabled().len())
            .finish()
    }
}
