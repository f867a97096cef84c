//! nakimi-core - Shared functionality for the nakimi vault
//!
//! Standard paths, configuration resolution and external tool lookup.

pub mod config;
pub mod paths;
pub mod process;

pub use config::{Backend, Config, ConfigError, FileConfig, HardwareConfig};
pub use paths::Paths;
