//! Plugin distribution and execution engine.
//!
//! Modules are fetched from a module proxy, cached on disk, unpacked into a
//! module tree and started as WebAssembly plugins:
//!
//! 1. [`Client`] resolves a version reference and downloads the archive
//!    ([`ProxyClient`] over HTTP, [`CachedClient`] on top of it).
//! 2. [`Service::extract`] unpacks the archive into `<root>/src/<path>` and
//!    extracts vendored dependencies.
//! 3. [`Service::run`] loads `<alias>.wasm` (or `.wat`) from that directory,
//!    verifies the plugin contract and calls its constructor.
//!
//! # Security Model
//!
//! - **Confined extraction**: archive members must resolve inside the module
//!   directory and may not exceed their declared size
//! - **User trees are untouchable**: a module directory without a marker file
//!   is never modified or removed
//! - **Sandboxed**: WASM interpreter with fuel limits (no infinite loops)
//! - **Narrow host surface**: plugins only see the `std`, `sys` and `kiosk`
//!   imports; no filesystem or network access
//! - **Contract first**: export signatures are checked before any guest code
//!   beyond the start function runs

pub mod archive;
pub mod cache;
pub mod client;
pub mod decode;
pub mod error;
mod host;
pub mod instance;
pub mod loader;
pub mod registry;
pub mod service;
pub mod traits;
pub mod vendor;

pub use cache::CachedClient;
pub use client::{ArchiveReader, Client, ProxyClient, LATEST};
pub use error::{
    CacheError, ContractError, DescriptorError, Error, ExtractionError, ResolutionError, Result,
    RuntimeError,
};
pub use instance::PluginInstance;
pub use loader::{PluginLoader, DEFAULT_FUEL_LIMIT};
pub use registry::PluginRegistry;
pub use service::{Extraction, Service, HOST_MODULE_PATH, MARKER_FILE};
pub use traits::{
    BoundFn, Descriptor, Horizontal, Logger, ModuleVersion, PluginInfo, Position, TracingLogger,
    Ui, Vertical,
};
