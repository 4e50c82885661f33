//! Key-value backends for round persistence

use crate::{DbError, DbResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Minimal key-value backend the round store runs on
pub trait RoundBackend: Send + Sync {
    /// Get value by key
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    /// Put key-value pair
    fn put(&self, key: &[u8], value: &[u8]) -> DbResult<()>;

    /// Check if key exists
    fn exists(&self, key: &[u8]) -> DbResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// In-memory backend for tests and light tooling
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoundBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let data = self
            .data
            .read()
            .map_err(|e| DbError::Other(format!("lock poisoned: {e}")))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| DbError::Other(format!("lock poisoned: {e}")))?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

/// RocksDB-backed persistent backend
pub struct RocksBackend {
    db: rocksdb::DB,
}

impl RocksBackend {
    /// Open (or create) a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl RoundBackend for RocksBackend {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.db.put(key, value)?;
        Ok(())
    }
}
