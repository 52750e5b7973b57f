// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! The variants follow how an error is resolved:
//! - `Validation` / `Conflict` are returned from the operator action that
//!   raised them and never leave persisted state modified.
//! - `TransientExecution` / `FatalExecution` describe task failures. They are
//!   recorded on task rows by the executor and logged; they are never
//!   returned from a tick or an operator action.
//! - `Infrastructure` covers an unreachable store or agent pool.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task failed (will retry): {0}")]
    TransientExecution(String),

    #[error("Task failed: {0}")]
    FatalExecution(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    pub fn validation(msg: impl Into<String>) -> Self {
        FlowError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        FlowError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        FlowError::NotFound(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        FlowError::Infrastructure(msg.into())
    }

    /// Whether the caller may retry the same action after inspecting state.
    ///
    /// Only infrastructure failures qualify; validation and conflict errors
    /// will fail again until the request or the state changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Infrastructure(_) | FlowError::Io(_))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlowError>;
