//! Plugin-facing types.
//!
//! Descriptors come from configuration, the identity payload is serialized
//! into guest memory, and the `Ui`/`Logger` traits are the host handles a
//! plugin reaches through its imports.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::DescriptorError;

static MODULE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\-_]+$").expect("module name pattern is valid"));

/// A module path pinned to a concrete version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub path: String,
    pub version: String,
}

impl ModuleVersion {
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
        }
    }

    /// Prefix every archive entry of this module must carry.
    pub fn archive_prefix(&self) -> String {
        format!("{}@{}/", self.path, self.version)
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.version)
    }
}

/// Vertical grid slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vertical {
    #[default]
    Top,
    Middle,
    Bottom,
}

/// Horizontal grid slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizontal {
    #[default]
    Left,
    Center,
    Right,
}

/// Position of a module in the display grid, written as `vertical:horizontal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Position {
    pub vertical: Vertical,
    pub horizontal: Horizontal,
}

impl FromStr for Position {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [vertical, horizontal] = parts.as_slice() else {
            return Err(DescriptorError::InvalidPosition(s.to_string()));
        };

        let vertical = match *vertical {
            "top" => Vertical::Top,
            "middle" => Vertical::Middle,
            "bottom" => Vertical::Bottom,
            other => return Err(DescriptorError::InvalidVertical(other.to_string())),
        };
        let horizontal = match *horizontal {
            "left" => Horizontal::Left,
            "center" => Horizontal::Center,
            "right" => Horizontal::Right,
            other => return Err(DescriptorError::InvalidHorizontal(other.to_string())),
        };

        Ok(Self {
            vertical,
            horizontal,
        })
    }
}

impl TryFrom<String> for Position {
    type Error = DescriptorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Position> for String {
    fn from(value: Position) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vertical = match self.vertical {
            Vertical::Top => "top",
            Vertical::Middle => "middle",
            Vertical::Bottom => "bottom",
        };
        let horizontal = match self.horizontal {
            Horizontal::Left => "left",
            Horizontal::Center => "center",
            Horizontal::Right => "right",
        };
        write!(f, "{vertical}:{horizontal}")
    }
}

/// Describes one module instance and its configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    /// Unique instance name
    pub name: String,
    /// Registry coordinate of the module
    pub path: String,
    /// Version reference; empty means the module tree is managed by the user
    #[serde(default)]
    pub version: String,
    /// Import alias override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default)]
    pub position: Position,
    /// Opaque configuration document, decoded against the module's defaults
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Descriptor {
    /// Validate a module descriptor.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.is_empty() {
            return Err(DescriptorError::MissingName);
        }
        if !MODULE_NAME.is_match(&self.name) {
            return Err(DescriptorError::InvalidName(self.name.clone()));
        }
        if self.path.is_empty() {
            return Err(DescriptorError::MissingPath(self.name.clone()));
        }
        Ok(())
    }

    /// Import alias of the module.
    ///
    /// Uses the `package` override when set, otherwise the last `-`-delimited
    /// segment of the final path element (`github.com/acme/kiosk-clock` → `clock`).
    pub fn import_alias(&self) -> &str {
        if let Some(pkg) = self.package.as_deref().filter(|p| !p.is_empty()) {
            return pkg;
        }
        let base = self.path.rsplit('/').next().unwrap_or(&self.path);
        base.rsplit('-').next().unwrap_or(base)
    }
}

/// Identity handed to a plugin constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Instance name; targets this specific instance of the module
    pub name: String,
    /// Absolute path of the extracted module, for loading assets
    pub path: PathBuf,
}

/// Structured leveled logger handed to plugins.
pub trait Logger: Send + Sync {
    fn info(&self, msg: &str, fields: &[(&str, &str)]);
    fn error(&self, msg: &str, fields: &[(&str, &str)]);
}

/// [`Logger`] that forwards to `tracing`, tagged with the instance name.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    module: String,
}

impl TracingLogger {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
        }
    }
}

fn render_fields(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Logger for TracingLogger {
    fn info(&self, msg: &str, fields: &[(&str, &str)]) {
        tracing::info!(module = %self.module, ctx = %render_fields(fields), "{msg}");
    }

    fn error(&self, msg: &str, fields: &[(&str, &str)]) {
        tracing::error!(module = %self.module, ctx = %render_fields(fields), "{msg}");
    }
}

/// Host callback registered through [`Ui::bind`].
pub type BoundFn =
    Arc<dyn Fn(&[serde_json::Value]) -> anyhow::Result<serde_json::Value> + Send + Sync>;

/// UI handle of one module instance.
pub trait Ui: Send + Sync {
    /// Add CSS for use by the module.
    fn load_css(&self, css: &str) -> anyhow::Result<()>;
    /// Load HTML into the module's element.
    fn load_html(&self, html: &str) -> anyhow::Result<()>;
    /// Expose a function to the UI under `name`.
    fn bind(&self, name: &str, func: BoundFn) -> anyhow::Result<()>;
    /// Evaluate a command in the UI.
    fn eval(&self, cmd: &str, args: &[serde_json::Value]) -> anyhow::Result<serde_json::Value>;
}
