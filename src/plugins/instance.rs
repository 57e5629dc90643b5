//! Live plugin handle.

use wasmi::Instance;

use super::error::{Result, RuntimeError};
use super::host::SharedStore;

/// A constructed plugin, owned by the caller until [`close`](Self::close).
///
/// The instance owns its interpreter store. Callbacks the plugin bound into
/// the UI stop working once the instance is closed or dropped.
pub struct PluginInstance {
    name: String,
    handle: i32,
    store: SharedStore,
    instance: Instance,
    closed: bool,
}

impl PluginInstance {
    pub(crate) fn new(name: String, handle: i32, store: SharedStore, instance: Instance) -> Self {
        Self {
            name,
            handle,
            store,
            instance,
            closed: false,
        }
    }

    /// Descriptor name of the instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque guest handle returned by the constructor.
    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the plugin by calling its `close` export.
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut guard = self.store.lock();
        let store = &mut *guard;
        let trap = |e: wasmi::Error| RuntimeError::Trap {
            name: self.name.clone(),
            export: "close".into(),
            reason: e.to_string(),
        };

        let fuel = store.data().fuel_limit;
        store.set_fuel(fuel).map_err(trap)?;
        store.data_mut().last_error = None;

        let close = self
            .instance
            .get_typed_func::<i32, i32>(&*store, "close")
            .map_err(trap)?;
        let result = close.call(&mut *store, self.handle);
        store.data_mut().closed = true;
        let status = result.map_err(trap)?;

        if status != 0 {
            let message = store
                .data_mut()
                .last_error
                .take()
                .unwrap_or_else(|| format!("close returned {status}"));
            return Err(RuntimeError::Close {
                name: self.name.clone(),
                message,
            }
            .into());
        }

        tracing::info!(module = %self.name, "Plugin closed");
        Ok(())
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
