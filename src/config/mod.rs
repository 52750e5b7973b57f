// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs`: the TOML-backed data model.
//! - `loader.rs`: reading a config file.
//! - `validate.rs`: `RawConfigFile` → `ConfigFile`, compiling schedules and
//!   workflow graphs so a bad revision is rejected before it is applied.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_and_validate_with, load_from_path};
pub use model::{ConfigFile, RawConfigFile, ServerConfig};
