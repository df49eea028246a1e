//! Native instance lifecycle.
//!
//! Each [`Handle`] names one native model instance and, through it, one
//! audio stream. Handles are move-only: [`NativeModule::destroy`] consumes
//! the handle, so a destroyed handle cannot be processed or destroyed again
//! from safe code. Mixing handles between two modules is still the caller's
//! responsibility; the bridge does not validate ids on the hot path.
//!
//! Every successful `create` holds native heap until the matching
//! `destroy`. There is no collection of abandoned handles.

use crate::error::{BridgeError, Result};
use crate::runtime::{call_error, NativeModule};

/// Opaque reference to one native model instance.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    id: i32,
}

impl Handle {
    /// Native instance id, as returned by the guest.
    pub fn id(&self) -> i32 {
        self.id
    }
}

impl NativeModule {
    /// Allocate a new native instance with zeroed stream state.
    pub fn create(&mut self) -> Result<Handle> {
        self.refuel_lifecycle()?;
        let id = self
            .create_fn
            .call(&mut self.store, ())
            .map_err(call_error)?;
        if id < 0 {
            return Err(BridgeError::InstanceCreation(id));
        }

        self.live += 1;
        tracing::debug!(id, live = self.live, "native instance created");
        Ok(Handle { id })
    }

    /// Release every native resource owned by `handle`.
    pub fn destroy(&mut self, handle: Handle) {
        self.live = self.live.saturating_sub(1);

        let result = self
            .refuel_lifecycle()
            .and_then(|()| {
                self.destroy_fn
                    .call(&mut self.store, handle.id)
                    .map_err(call_error)
            });
        match result {
            Ok(()) => tracing::debug!(id = handle.id, live = self.live, "native instance destroyed"),
            Err(e) => tracing::warn!(id = handle.id, "native destroy failed: {}", e),
        }
    }
}
