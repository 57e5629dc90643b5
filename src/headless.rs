//! Headless stand-in for the display window.
//!
//! Logs what plugins load and keeps their bound callbacks so the engine can
//! run without a browser attached.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use kiosk::plugins::{BoundFn, Position, Ui};

pub struct HeadlessUi {
    module: String,
    position: Position,
    bindings: Mutex<HashMap<String, BoundFn>>,
}

impl HeadlessUi {
    pub fn new(module: impl Into<String>, position: Position) -> Self {
        Self {
            module: module.into(),
            position,
            bindings: Mutex::new(HashMap::new()),
        }
    }
}

impl Ui for HeadlessUi {
    fn load_css(&self, css: &str) -> anyhow::Result<()> {
        tracing::debug!(module = %self.module, bytes = css.len(), "Loaded CSS");
        Ok(())
    }

    fn load_html(&self, html: &str) -> anyhow::Result<()> {
        tracing::info!(
            module = %self.module,
            position = %self.position,
            bytes = html.len(),
            "Loaded HTML"
        );
        Ok(())
    }

    fn bind(&self, name: &str, func: BoundFn) -> anyhow::Result<()> {
        tracing::debug!(module = %self.module, name, "Bound function");
        self.bindings.lock().insert(name.to_string(), func);
        Ok(())
    }

    fn eval(&self, cmd: &str, args: &[Value]) -> anyhow::Result<Value> {
        tracing::debug!(module = %self.module, cmd, args = args.len(), "Ignoring eval without a window");
        Ok(Value::Null)
    }
}

impl std::fmt::Debug for HeadlessUi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessUi")
            .field("module", &self.module)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}
