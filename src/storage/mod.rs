// src/storage/mod.rs

//! Object storage for task logs.
//!
//! Nothing in here takes part in scheduling decisions; the engine only writes
//! logs through it and the `log` command reads them back.

pub mod local;
pub mod memory;

use std::fmt::Debug;
use std::io::Read;

use chrono::{DateTime, Utc};

use crate::errors::{FlowError, Result};
use crate::types::AttemptId;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// Maximum number of entries handed to one `list` callback invocation.
pub const LIST_CHUNK_SIZE: usize = 100;

/// Produces the content of an object being stored.
///
/// A provider may be called more than once (an implementation is free to
/// re-read the content), so it must return a fresh reader each time.
pub type ContentProvider<'a> = &'a (dyn Fn() -> anyhow::Result<Box<dyn Read + Send>> + Sync);

/// One entry returned from [`ObjectStorage::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    /// Hex blake3 digest of the content.
    pub checksum: String,
}

pub trait ObjectStorage: Send + Sync + Debug {
    /// Store `size` bytes read from `provider` under `key`, replacing any
    /// previous object. Returns the checksum of the stored content.
    ///
    /// Fails with `Validation` when the provider yields a different number
    /// of bytes than `size`.
    fn put(&self, key: &str, size: u64, provider: ContentProvider<'_>) -> Result<String>;

    /// Open an object for reading. Unknown keys are `NotFound`.
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Visit every object whose key starts with `prefix`, in ascending key
    /// order, in chunks of at most [`LIST_CHUNK_SIZE`] entries.
    fn list(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(Vec<ObjectSummary>) -> Result<()>,
    ) -> Result<()>;
}

/// Read the whole content from `provider`, checking it against `size`.
pub(crate) fn read_content(key: &str, size: u64, provider: ContentProvider<'_>) -> Result<Vec<u8>> {
    let mut reader = provider()?;
    let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    reader.read_to_end(&mut buf)?;
    if buf.len() as u64 != size {
        return Err(FlowError::validation(format!(
            "object '{key}': declared size {size} but content has {} bytes",
            buf.len()
        )));
    }
    Ok(buf)
}

pub(crate) fn checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hand sorted summaries to `callback` in chunks.
pub(crate) fn emit_chunks(
    mut entries: Vec<ObjectSummary>,
    callback: &mut dyn FnMut(Vec<ObjectSummary>) -> Result<()>,
) -> Result<()> {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    let mut rest = entries;
    while !rest.is_empty() {
        let tail = rest.split_off(rest.len().min(LIST_CHUNK_SIZE));
        callback(rest)?;
        rest = tail;
    }
    Ok(())
}

/// Prefix under which all logs of an attempt are stored.
pub fn attempt_log_prefix(attempt_id: AttemptId) -> String {
    format!("logs/{attempt_id}/")
}

/// Key of one task log file:
/// `logs/<attempt_id>/<task_name>/<unix_millis>.log`.
pub fn task_log_key(attempt_id: AttemptId, task_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}/{}.log",
        attempt_log_prefix(attempt_id),
        task_name,
        at.timestamp_millis()
    )
}

/// Split a task log key back into `(task_name, unix_millis)`.
pub fn parse_task_log_key(key: &str) -> Option<(String, i64)> {
    let rest = key.strip_prefix("logs/")?;
    let (_, rest) = rest.split_once('/')?;
    let (task, file) = rest.rsplit_once('/')?;
    let millis = file.strip_suffix(".log")?.parse().ok()?;
    Some((task.to_string(), millis))
}
