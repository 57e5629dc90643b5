//! Host surface linked into every plugin store.
//!
//! Guest imports by namespace:
//!
//! | namespace | import | signature |
//! |-----------|--------|-----------|
//! | `std` | `now_ms` | `() -> i64` |
//! | `std` | `context_done` | `() -> i32` |
//! | `sys` | `set_error` | `(ptr, len)` |
//! | `kiosk` | `log_info`, `log_error` | `(msg_ptr, msg_len, fields_ptr, fields_len)` |
//! | `kiosk` | `ui_load_css`, `ui_load_html`, `ui_bind` | `(ptr, len) -> i32` |
//! | `kiosk` | `ui_eval` | `(req_ptr, req_len, out_ptr, out_cap) -> i32` |
//!
//! Strings are UTF-8 in guest memory. `ui_*` imports return `0` on success
//! and `-1` on failure; `ui_eval` returns the full length of the JSON result,
//! writing at most `out_cap` bytes of it.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wasmi::{AsContext, AsContextMut, Caller, Engine, Extern, Instance, Linker, Memory, Store};

use super::traits::{BoundFn, Logger, Ui};

/// How long a bound callback waits for a busy plugin before giving up.
const CALLBACK_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to a plugin store.
pub(crate) type SharedStore = Arc<Mutex<Store<HostState>>>;

/// Per-instance data reachable from host functions.
pub(crate) struct HostState {
    pub name: String,
    pub logger: Arc<dyn Logger>,
    pub ui: Arc<dyn Ui>,
    pub ctx: CancellationToken,
    pub fuel_limit: u64,
    /// Message recorded by the guest through `sys.set_error`
    pub last_error: Option<String>,
    pub instance: Option<Instance>,
    pub closed: bool,
    this: Weak<Mutex<Store<HostState>>>,
}

impl HostState {
    pub fn new(
        name: impl Into<String>,
        logger: Arc<dyn Logger>,
        ui: Arc<dyn Ui>,
        ctx: CancellationToken,
        fuel_limit: u64,
        this: Weak<Mutex<Store<HostState>>>,
    ) -> Self {
        Self {
            name: name.into(),
            logger,
            ui,
            ctx,
            fuel_limit,
            last_error: None,
            instance: None,
            closed: false,
            this,
        }
    }
}

fn offset(ptr: i32) -> usize {
    ptr as u32 as usize
}

fn guest_memory(caller: &Caller<'_, HostState>) -> Result<Memory, wasmi::Error> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmi::Error::new("plugin does not export memory"))
}

/// Copy `len` bytes at `ptr` out of `memory`.
pub(crate) fn read_bytes(
    memory: &Memory,
    ctx: impl AsContext,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, wasmi::Error> {
    let len = usize::try_from(len).map_err(|_| wasmi::Error::new(format!("negative length {len}")))?;
    let start = offset(ptr);
    let data = memory.data(&ctx);
    let bytes = start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| wasmi::Error::new(format!("read of {len} bytes at {ptr:#x} is out of bounds")))?;
    Ok(bytes.to_vec())
}

fn read_str(caller: &Caller<'_, HostState>, ptr: i32, len: i32) -> Result<String, wasmi::Error> {
    let memory = guest_memory(caller)?;
    let bytes = read_bytes(&memory, caller, ptr, len)?;
    String::from_utf8(bytes).map_err(|e| wasmi::Error::new(format!("invalid UTF-8: {e}")))
}

/// Copy `bytes` into fresh guest memory obtained from the `alloc` export.
///
/// Returns the guest pointer and length.
pub(crate) fn pass_bytes(
    mut store: impl AsContextMut<Data = HostState>,
    instance: &Instance,
    bytes: &[u8],
) -> Result<(i32, i32), wasmi::Error> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| wasmi::Error::new(format!("payload of {} bytes is too large", bytes.len())))?;
    let alloc = instance.get_typed_func::<i32, i32>(&store, "alloc")?;
    let ptr = alloc.call(&mut store, len)?;
    let memory = instance
        .get_memory(&store, "memory")
        .ok_or_else(|| wasmi::Error::new("plugin does not export memory"))?;
    memory
        .write(&mut store, offset(ptr), bytes)
        .map_err(|e| wasmi::Error::new(format!("write of {len} bytes at {ptr:#x}: {e}")))?;
    Ok((ptr, len))
}

fn log_fields(caller: &Caller<'_, HostState>, ptr: i32, len: i32) -> Result<Vec<(String, String)>, wasmi::Error> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let raw = read_str(caller, ptr, len)?;
    let fields: serde_json::Map<String, Value> = serde_json::from_str(&raw)
        .map_err(|e| wasmi::Error::new(format!("log fields must be a JSON object: {e}")))?;
    Ok(fields
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

fn ui_status(caller: &Caller<'_, HostState>, op: &str, result: anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(module = %caller.data().name, op, error = %e, "UI call failed");
            -1
        }
    }
}

/// Build the callback registered with the UI for a guest export.
fn bound_callback(weak: Weak<Mutex<Store<HostState>>>, instance: Instance, export: String) -> BoundFn {
    Arc::new(move |args: &[Value]| {
        let cell = weak
            .upgrade()
            .ok_or_else(|| anyhow!("{export}: plugin instance is gone"))?;
        let mut guard = cell
            .try_lock_for(CALLBACK_LOCK_TIMEOUT)
            .ok_or_else(|| anyhow!("{export}: plugin is busy"))?;
        let store = &mut *guard;
        if store.data().closed {
            return Err(anyhow!("{export}: plugin instance is closed"));
        }

        let payload = serde_json::to_vec(args)?;
        let fuel = store.data().fuel_limit;
        store.set_fuel(fuel)?;
        store.data_mut().last_error = None;

        let (ptr, len) = pass_bytes(&mut *store, &instance, &payload)?;
        let func = instance.get_typed_func::<(i32, i32), i32>(&*store, &export)?;
        let ret = func.call(&mut *store, (ptr, len))?;

        match store.data_mut().last_error.take() {
            Some(message) => Err(anyhow!("{export}: {message}")),
            None => Ok(Value::from(ret)),
        }
    })
}

fn ui_bind(caller: &Caller<'_, HostState>, export: String) -> anyhow::Result<()> {
    let state = caller.data();
    let instance = state
        .instance
        .ok_or_else(|| anyhow!("bind called before instantiation"))?;
    instance
        .get_typed_func::<(i32, i32), i32>(caller, &export)
        .map_err(|e| anyhow!("cannot bind {export:?}: {e}"))?;
    let callback = bound_callback(state.this.clone(), instance, export.clone());
    state.ui.bind(&export, callback)
}

fn ui_eval(
    caller: &mut Caller<'_, HostState>,
    req_ptr: i32,
    req_len: i32,
    out_ptr: i32,
    out_cap: i32,
) -> Result<i32, wasmi::Error> {
    #[derive(serde::Deserialize)]
    struct EvalRequest {
        cmd: String,
        #[serde(default)]
        args: Vec<Value>,
    }

    let raw = read_str(caller, req_ptr, req_len)?;
    let request: EvalRequest = match serde_json::from_str(&raw) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(module = %caller.data().name, error = %e, "Malformed eval request");
            return Ok(-1);
        }
    };
    let result = match caller.data().ui.eval(&request.cmd, &request.args) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(module = %caller.data().name, cmd = %request.cmd, error = %e, "UI eval failed");
            return Ok(-1);
        }
    };

    let out = serde_json::to_vec(&result).map_err(|e| wasmi::Error::new(e.to_string()))?;
    let cap = usize::try_from(out_cap).unwrap_or(0);
    let n = out.len().min(cap);
    if n > 0 {
        let memory = guest_memory(caller)?;
        memory
            .write(&mut *caller, offset(out_ptr), &out[..n])
            .map_err(|e| wasmi::Error::new(format!("write of {n} bytes at {out_ptr:#x}: {e}")))?;
    }
    i32::try_from(out.len()).map_err(|_| wasmi::Error::new("eval result is too large"))
}

/// Linker exposing the host surface to a plugin.
pub(crate) fn linker(engine: &Engine) -> anyhow::Result<Linker<HostState>> {
    let mut linker = Linker::<HostState>::new(engine);

    linker.func_wrap("std", "now_ms", || -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    })?;
    linker.func_wrap("std", "context_done", |caller: Caller<'_, HostState>| -> i32 {
        i32::from(caller.data().ctx.is_cancelled())
    })?;

    linker.func_wrap(
        "sys",
        "set_error",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<(), wasmi::Error> {
            let message = read_str(&caller, ptr, len)?;
            caller.data_mut().last_error = Some(message);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "kiosk",
        "log_info",
        |caller: Caller<'_, HostState>, ptr: i32, len: i32, fptr: i32, flen: i32| -> Result<(), wasmi::Error> {
            let msg = read_str(&caller, ptr, len)?;
            let fields = log_fields(&caller, fptr, flen)?;
            let fields: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            caller.data().logger.info(&msg, &fields);
            Ok(())
        },
    )?;
    linker.func_wrap(
        "kiosk",
        "log_error",
        |caller: Caller<'_, HostState>, ptr: i32, len: i32, fptr: i32, flen: i32| -> Result<(), wasmi::Error> {
            let msg = read_str(&caller, ptr, len)?;
            let fields = log_fields(&caller, fptr, flen)?;
            let fields: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            caller.data().logger.error(&msg, &fields);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "kiosk",
        "ui_load_css",
        |caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<i32, wasmi::Error> {
            let css = read_str(&caller, ptr, len)?;
            let result = caller.data().ui.load_css(&css);
            Ok(ui_status(&caller, "load_css", result))
        },
    )?;
    linker.func_wrap(
        "kiosk",
        "ui_load_html",
        |caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<i32, wasmi::Error> {
            let html = read_str(&caller, ptr, len)?;
            let result = caller.data().ui.load_html(&html);
            Ok(ui_status(&caller, "load_html", result))
        },
    )?;
    linker.func_wrap(
        "kiosk",
        "ui_bind",
        |caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<i32, wasmi::Error> {
            let export = read_str(&caller, ptr, len)?;
            let result = ui_bind(&caller, export);
            Ok(ui_status(&caller, "bind", result))
        },
    )?;
    linker.func_wrap(
        "kiosk",
        "ui_eval",
        |mut caller: Caller<'_, HostState>, req_ptr: i32, req_len: i32, out_ptr: i32, out_cap: i32| {
            ui_eval(&mut caller, req_ptr, req_len, out_ptr, out_cap)
        },
    )?;

    Ok(linker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_treats_pointers_as_unsigned() {
        assert_eq!(offset(16), 16);
        assert_eq!(offset(-1), u32::MAX as usize);
    }

    #[test]
    fn read_bytes_stays_within_memory() {
        let engine = Engine::default();
        let module = wasmi::Module::new(&engine, r#"(module (memory (export "memory") 1) (data (i32.const 0) "kiosk"))"#).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Linker::<()>::new(&engine)
            .instantiate_and_start(&mut store, &module)
            .unwrap();
        let memory = instance.get_memory(&store, "memory").unwrap();

        assert_eq!(read_bytes(&memory, &store, 0, 5).unwrap(), b"kiosk");
        assert_eq!(read_bytes(&memory, &store, 65_536, 0).unwrap(), b"");
        for (ptr, len) in [(0, i32::MAX), (65_530, 7), (-1, 1), (0, -1)] {
            assert!(read_bytes(&memory, &store, ptr, len).is_err(), "({ptr}, {len})");
        }
    }

    #[test]
    fn linker_builds_for_fresh_engine() {
        let engine = Engine::default();
        assert!(linker(&engine).is_ok());
    }
}
