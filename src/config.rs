//! Engine configuration.
//!
//! ```toml
//! [registry]
//! proxy_url = "https://proxy.golang.org"
//! timeout_secs = 30
//!
//! [plugins]
//! dir = "~/.local/share/kiosk/modules"
//! cache_dir = "~/.cache/kiosk"
//! fuel_limit = 10000000
//!
//! [[modules]]
//! name = "clock"
//! path = "github.com/acme/kiosk-clock"
//! version = "latest"
//! position = "top:right"
//!
//! [modules.config]
//! format = "15:04"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::plugins::{Descriptor, PluginRegistry, DEFAULT_FUEL_LIMIT};

/// Default module proxy.
pub const DEFAULT_PROXY_URL: &str = "https://proxy.golang.org";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "kiosk", "kiosk")
}

/// Default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub modules: Vec<Descriptor>,
}

/// Module proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_proxy_url() -> String {
    DEFAULT_PROXY_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Module tree and runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginsConfig {
    /// Module root; modules live under `<dir>/src`
    #[serde(default)]
    pub dir: Option<String>,
    /// Archive cache; defaults to the platform cache directory
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default = "default_fuel_limit")]
    pub fuel_limit: u64,
}

fn default_fuel_limit() -> u64 {
    DEFAULT_FUEL_LIMIT
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            cache_dir: None,
            fuel_limit: DEFAULT_FUEL_LIMIT,
        }
    }
}

impl PluginsConfig {
    /// Module root, `~` expanded.
    pub fn modules_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(expand(dir)),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().join("modules"))
                .context("could not determine a data directory; set plugins.dir"),
        }
    }

    /// Archive cache root, `~` expanded.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(expand(dir)),
            None => project_dirs()
                .map(|dirs| dirs.cache_dir().join("download"))
                .context("could not determine a cache directory; set plugins.cache_dir"),
        }
    }
}

impl Config {
    /// Parse a configuration document.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid configuration")?;
        config.registry()?;
        Ok(config)
    }

    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("in {}", path.display()))?;
        tracing::debug!(path = %path.display(), modules = config.modules.len(), "Loaded configuration");
        Ok(config)
    }

    /// Validated descriptor set.
    pub fn registry(&self) -> Result<PluginRegistry> {
        Ok(PluginRegistry::new(self.modules.clone())?)
    }
}
