//! WASM plugin loader.
//!
//! Loads a plugin module into a fresh `wasmi` interpreter, verifies the
//! constructor contract from its export table and invokes the constructor.
//! Execution is bounded by fuel, re-armed before every guest call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wasmi::{Config, Engine, Instance, Module, Store, ValType};

use super::decode::decode_into;
use super::error::{ContractError, Result, RuntimeError};
use super::host::{self, HostState, SharedStore};
use super::instance::PluginInstance;
use super::traits::{Logger, PluginInfo, Ui};

/// Default fuel limit for a single guest call (prevents infinite loops).
pub const DEFAULT_FUEL_LIMIT: u64 = 10_000_000;

const ALLOC_SIGNATURE: &str = "(i32) -> i32";
const NEW_CONFIG_SIGNATURE: &str = "() -> (i32, i32)";
const NEW_SIGNATURE: &str = "(i32, i32, i32, i32) -> (i32, i32)";
const CLOSE_SIGNATURE: &str = "(i32) -> i32";

/// Loader for one plugin module.
pub struct PluginLoader {
    /// Descriptor name
    name: String,
    /// Path to the entry module (`.wasm` or `.wat`)
    module_path: PathBuf,
    /// Configuration document from the descriptor
    config: Value,
    /// Fuel limit per guest call
    fuel_limit: u64,
}

impl PluginLoader {
    /// Create a new plugin loader.
    pub fn new(name: impl Into<String>, module_path: impl Into<PathBuf>, config: Value) -> Self {
        Self {
            name: name.into(),
            module_path: module_path.into(),
            config,
            fuel_limit: DEFAULT_FUEL_LIMIT,
        }
    }

    /// Set a custom fuel limit for execution.
    pub fn with_fuel_limit(mut self, limit: u64) -> Self {
        self.fuel_limit = limit;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    /// Check if the plugin module exists.
    pub fn module_exists(&self) -> bool {
        self.module_path.is_file()
    }

    fn import_error(&self, reason: impl std::fmt::Display) -> ContractError {
        ContractError::Import {
            name: self.name.clone(),
            path: self.module_path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    fn trap(&self, export: &str) -> impl Fn(wasmi::Error) -> RuntimeError + '_ {
        let export = export.to_string();
        move |e| RuntimeError::Trap {
            name: self.name.clone(),
            export: export.clone(),
            reason: e.to_string(),
        }
    }

    fn arm(&self, store: &mut Store<HostState>) -> Result<(), RuntimeError> {
        store.set_fuel(self.fuel_limit).map_err(self.trap("fuel"))
    }

    /// Load the module, check its contract and construct the plugin.
    pub fn load(
        &self,
        ctx: &CancellationToken,
        info: &PluginInfo,
        ui: Arc<dyn Ui>,
        logger: Arc<dyn Logger>,
    ) -> Result<PluginInstance> {
        let bytes = std::fs::read(&self.module_path).map_err(|e| self.import_error(e))?;

        let mut config = Config::default();
        config.consume_fuel(true);
        let engine = Engine::new(&config);
        let module = Module::new(&engine, &bytes[..]).map_err(|e| self.import_error(e))?;
        let linker = host::linker(&engine).map_err(|e| self.import_error(e))?;

        tracing::debug!(
            module = %self.name,
            module_path = %self.module_path.display(),
            module_size = bytes.len(),
            "Loading plugin module"
        );

        let store: SharedStore = Arc::new_cyclic(|this| {
            let state = HostState::new(&self.name, logger, ui, ctx.clone(), self.fuel_limit, this.clone());
            Mutex::new(Store::new(&engine, state))
        });

        let (instance, handle) = {
            let mut guard = store.lock();
            let store = &mut *guard;

            self.arm(store)?;
            let instance = linker
                .instantiate_and_start(&mut *store, &module)
                .map_err(|e| self.import_error(e))?;
            store.data_mut().instance = Some(instance);

            self.check_contract(store, &instance)?;
            let config = self.default_config(store, &instance)?;
            let handle = self.construct(store, &instance, &config, info)?;
            (instance, handle)
        };

        tracing::info!(module = %self.name, handle, "Plugin constructed");
        Ok(PluginInstance::new(self.name.clone(), handle, store, instance))
    }

    fn check_export(
        &self,
        store: &Store<HostState>,
        instance: &Instance,
        export: &'static str,
        params: &[ValType],
        results: &[ValType],
        expected: &'static str,
    ) -> Result<(), ContractError> {
        let func = instance
            .get_func(store, export)
            .ok_or_else(|| ContractError::MissingExport {
                name: self.name.clone(),
                export,
            })?;
        let ty = func.ty(store);
        if ty.params() != params || ty.results() != results {
            return Err(ContractError::Signature {
                name: self.name.clone(),
                export,
                expected,
            });
        }
        Ok(())
    }

    /// Verify every export the host calls before any of them runs.
    fn check_contract(&self, store: &Store<HostState>, instance: &Instance) -> Result<(), ContractError> {
        use ValType::I32;

        if instance.get_memory(store, "memory").is_none() {
            return Err(ContractError::MissingExport {
                name: self.name.clone(),
                export: "memory",
            });
        }
        self.check_export(store, instance, "alloc", &[I32], &[I32], ALLOC_SIGNATURE)?;
        self.check_export(store, instance, "new_config", &[], &[I32, I32], NEW_CONFIG_SIGNATURE)?;
        self.check_export(store, instance, "new", &[I32; 4], &[I32, I32], NEW_SIGNATURE)?;
        self.check_export(store, instance, "close", &[I32], &[I32], CLOSE_SIGNATURE)?;
        Ok(())
    }

    /// Call `new_config` and decode the descriptor's document into it.
    fn default_config(&self, store: &mut Store<HostState>, instance: &Instance) -> Result<Value> {
        let config_error = |reason: String| ContractError::Config {
            name: self.name.clone(),
            reason,
        };

        self.arm(store)?;
        let new_config = instance
            .get_typed_func::<(), (i32, i32)>(&*store, "new_config")
            .map_err(self.trap("new_config"))?;
        let (ptr, len) = new_config.call(&mut *store, ()).map_err(self.trap("new_config"))?;

        let memory = instance
            .get_memory(&*store, "memory")
            .ok_or_else(|| ContractError::MissingExport {
                name: self.name.clone(),
                export: "memory",
            })?;
        let raw = host::read_bytes(&memory, &*store, ptr, len).map_err(|e| RuntimeError::Memory {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let defaults: Value = serde_json::from_slice(&raw)
            .map_err(|e| config_error(format!("default configuration is not valid JSON: {e}")))?;

        Ok(decode_into(defaults, &self.config).map_err(config_error)?)
    }

    fn construct(
        &self,
        store: &mut Store<HostState>,
        instance: &Instance,
        config: &Value,
        info: &PluginInfo,
    ) -> Result<i32> {
        let config = serde_json::to_vec(config).map_err(|e| ContractError::Config {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let info = serde_json::to_vec(info).map_err(|e| RuntimeError::Memory {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;

        self.arm(store)?;
        let (cfg_ptr, cfg_len) = host::pass_bytes(&mut *store, instance, &config).map_err(self.trap("alloc"))?;
        self.arm(store)?;
        let (info_ptr, info_len) = host::pass_bytes(&mut *store, instance, &info).map_err(self.trap("alloc"))?;

        self.arm(store)?;
        store.data_mut().last_error = None;
        let new = instance
            .get_typed_func::<(i32, i32, i32, i32), (i32, i32)>(&*store, "new")
            .map_err(self.trap("new"))?;
        let (handle, err) = new
            .call(&mut *store, (cfg_ptr, cfg_len, info_ptr, info_len))
            .map_err(self.trap("new"))?;

        if err != 0 {
            let message = store
                .data_mut()
                .last_error
                .take()
                .unwrap_or_else(|| format!("constructor returned error code {err}"));
            return Err(RuntimeError::Constructor {
                name: self.name.clone(),
                message,
            }
            .into());
        }
        if handle == 0 {
            return Err(RuntimeError::NilInstance {
                name: self.name.clone(),
            }
            .into());
        }
        Ok(handle)
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("name", &self.name)
            .field("module_path", &self.module_path)
            .field("fuel_limit", &self.fuel_limit)
            .finish_non_exhaustive()
    }
}
