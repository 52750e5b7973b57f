// src/storage/memory.rs

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::RwLock;

use super::{checksum, emit_chunks, read_content, ContentProvider, ObjectStorage, ObjectSummary};
use crate::errors::{FlowError, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    checksum: String,
}

/// In-memory object storage. Thread-safe via `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStorage for MemoryStorage {
    fn put(&self, key: &str, size: u64, provider: ContentProvider<'_>) -> Result<String> {
        let data = read_content(key, size, provider)?;
        let sum = checksum(&data);
        let mut objects = self
            .objects
            .write()
            .map_err(|_| FlowError::infrastructure("storage lock poisoned"))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                checksum: sum.clone(),
            },
        );
        Ok(sum)
    }

    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| FlowError::infrastructure("storage lock poisoned"))?;
        objects
            .get(key)
            .map(|o| Box::new(Cursor::new(o.data.clone())) as Box<dyn Read + Send>)
            .ok_or_else(|| FlowError::not_found(format!("object '{key}'")))
    }

    fn list(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(Vec<ObjectSummary>) -> Result<()>,
    ) -> Result<()> {
        let entries: Vec<ObjectSummary> = {
            let objects = self
                .objects
                .read()
                .map_err(|_| FlowError::infrastructure("storage lock poisoned"))?;
            objects
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, o)| ObjectSummary {
                    key: k.clone(),
                    size: o.data.len() as u64,
                    checksum: o.checksum.clone(),
                })
                .collect()
        };
        emit_chunks(entries, callback)
    }
}
