//! Kiosk plugin engine.
//!
//! Fetches display modules from a module proxy, unpacks them safely and runs
//! them as sandboxed WebAssembly plugins. See [`plugins`] for the engine and
//! [`config`] for the configuration file.

pub mod config;
pub mod plugins;
