// src/config/loader.rs

use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{FlowError, Result};
use crate::fs::{FileSystem, RealFileSystem};

/// Read and deserialize a config file without semantic validation.
pub fn load_from_path(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs
        .read_to_string(path)
        .map_err(|e| FlowError::Config(format!("cannot read {}: {e:#}", path.display())))?;
    parse_str(&contents)
}

/// Deserialize TOML text.
pub fn parse_str(contents: &str) -> Result<RawConfigFile> {
    Ok(toml::from_str(contents)?)
}

/// Load a config file from disk and validate it: durations, schedules and
/// every workflow graph.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    load_and_validate_with(&RealFileSystem, path)
}

pub fn load_and_validate_with(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(fs, path)?;
    ConfigFile::try_from(raw_config)
}

/// `sessionflow.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("sessionflow.toml")
}
