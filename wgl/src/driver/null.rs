//! Null driver.
//!
//! Installed as the calling thread's function table while no context is
//! current. It cannot create anything; unbinding always succeeds.

use std::sync::{Arc, OnceLock};

use super::{DeviceContext, Driver, DriverContext};
use crate::error::DriverError;

/// Function table used when no context is current.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDriver;

impl NullDriver {
    /// Get the shared null driver instance.
    pub fn shared() -> Arc<dyn Driver> {
        static SHARED: OnceLock<Arc<dyn Driver>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(NullDriver)))
    }
}

impl Driver for NullDriver {
    fn name(&self) -> &'static str {
        "Null"
    }

    fn create_context(&self, _dc: DeviceContext) -> Result<DriverContext, DriverError> {
        Err(DriverError::Unsupported("create_context"))
    }

    fn delete_context(&self, _ctx: DriverContext) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("delete_context"))
    }

    fn make_current(
        &self,
        _draw: Option<DeviceContext>,
        _read: Option<DeviceContext>,
        ctx: Option<DriverContext>,
    ) -> Result<(), DriverError> {
        match ctx {
            None => Ok(()),
            Some(_) => Err(DriverError::Unsupported("make_current")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{same_driver, BufferKey, MapOutcome, MapRequest, MapTransfer};

    #[test]
    fn test_null_unbind_succeeds() {
        assert!(NullDriver.make_current(None, None, None).is_ok());
        assert!(NullDriver
            .make_current(None, None, Some(DriverContext(1)))
            .is_err());
    }

    #[test]
    fn test_null_cannot_map() {
        let request = MapRequest::whole(BufferKey::Target(1), crate::driver::MapAccess::READ);
        assert!(matches!(
            NullDriver.map_buffer(&request, MapTransfer::Direct),
            MapOutcome::Failed(DriverError::Unsupported(_))
        ));
    }

    #[test]
    fn test_shared_is_singleton() {
        assert!(same_driver(&NullDriver::shared(), &NullDriver::shared()));
    }
}
