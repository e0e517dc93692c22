//! Common utilities for WGL integration tests.
//!
//! Tests run against a [`DummyDriver`] registered on a single surface, either
//! for native-width callers or for callers whose pointers cannot hold any
//! driver address, which forces every mapping through a shadow buffer.

#![allow(dead_code)]

use std::sync::Arc;

use redlilium_wgl::{
    BufferKey, DeviceContext, Driver, DummyDriver, Handle, PointerWidth, Wgl, WglParameters,
};

/// Surface every test context is created on.
pub const DC: DeviceContext = DeviceContext(0x10);

/// Target the test buffer is bound to.
pub const ARRAY_BUFFER: u32 = 0x8892;

/// Target the second test buffer is bound to.
pub const ELEMENT_ARRAY_BUFFER: u32 = 0x8893;

/// Initialize logging for test output.
pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

// ============================================================================
// Caller Widths
// ============================================================================

/// Address width the test caller runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// Caller pointers as wide as the host's.
    Native,
    /// Caller pointers too narrow for any driver address.
    Narrow,
}

impl Caller {
    pub fn name(self) -> &'static str {
        match self {
            Caller::Native => "native",
            Caller::Narrow => "narrow",
        }
    }

    pub fn to_parameters(self) -> WglParameters {
        let params = WglParameters::new().with_capacity(64);
        match self {
            Caller::Native => params,
            Caller::Narrow => params.with_pointer_width(PointerWidth::new(1)),
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// A [`Wgl`] instance with one dummy-driven surface.
pub struct TestWgl {
    pub wgl: Wgl,
    pub driver: Arc<DummyDriver>,
    pub caller: Caller,
}

impl TestWgl {
    pub fn new(caller: Caller) -> Self {
        init_logger();
        log::info!("Setting up {} test instance", caller.name());

        let driver = Arc::new(DummyDriver::new());
        let wgl = Wgl::new(caller.to_parameters());
        wgl.register_surface(DC, Arc::clone(&driver) as Arc<dyn Driver>);
        Self {
            wgl,
            driver,
            caller,
        }
    }

    /// Create a context on the test surface.
    pub fn create_context(&self) -> Handle {
        self.wgl.create_context(DC).expect("Failed to create context")
    }

    /// Create a context and bind it to the calling thread.
    pub fn bound_context(&self) -> Handle {
        let context = self.create_context();
        self.wgl
            .make_current(Some(DC), Some(context))
            .expect("Failed to bind context");
        context
    }

    /// Create a buffer bound to `target` filled with `fill`.
    pub fn create_buffer(&self, target: u32, len: usize, fill: u8) -> BufferKey {
        let key = BufferKey::Target(target);
        self.driver.create_buffer(key, &vec![fill; len]);
        key
    }

    /// Create a buffer bound to `target` whose bytes count up from zero.
    pub fn create_pattern_buffer(&self, target: u32, len: usize) -> BufferKey {
        let key = BufferKey::Target(target);
        let contents: Vec<u8> = (0..len).map(|i| i as u8).collect();
        self.driver.create_buffer(key, &contents);
        key
    }
}
