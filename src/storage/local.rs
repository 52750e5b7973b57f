// src/storage/local.rs

//! Object storage rooted at a local directory. Keys map to relative paths
//! with `/` as separator.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::{checksum, emit_chunks, read_content, ContentProvider, ObjectStorage, ObjectSummary};
use crate::errors::{FlowError, Result};
use crate::fs::{walk_files, FileSystem};

#[derive(Debug, Clone)]
pub struct LocalStorage {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(fs: Arc<dyn FileSystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let escapes = key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(FlowError::validation(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(rel))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

impl ObjectStorage for LocalStorage {
    fn put(&self, key: &str, size: u64, provider: ContentProvider<'_>) -> Result<String> {
        let path = self.path_of(key)?;
        let data = read_content(key, size, provider)?;
        self.fs.write(&path, &data).map_err(|e| {
            FlowError::infrastructure(format!("writing object '{key}': {e:#}"))
        })?;
        Ok(checksum(&data))
    }

    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path_of(key)?;
        if !self.fs.is_file(&path) {
            return Err(FlowError::not_found(format!("object '{key}'")));
        }
        Ok(self.fs.open_read(&path)?)
    }

    fn list(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(Vec<ObjectSummary>) -> Result<()>,
    ) -> Result<()> {
        let mut entries = Vec::new();
        for path in walk_files(self.fs.as_ref(), &self.root)? {
            let Some(key) = self.key_of(&path) else {
                continue;
            };
            // Leftovers of an interrupted write.
            if !key.starts_with(prefix) || key.ends_with(".tmp") {
                continue;
            }
            let mut data = Vec::new();
            self.fs.open_read(&path)?.read_to_end(&mut data)?;
            entries.push(ObjectSummary {
                key,
                size: data.len() as u64,
                checksum: checksum(&data),
            });
        }
        emit_chunks(entries, callback)
    }
}
