//! Storage collaborators: the object store holding uploaded photos and the
//! record store holding one item per photo.
//!
//! Both are traits so handlers stay agnostic of the backend. The in-memory
//! implementations back the binary and the tests; the record store one also
//! feeds its [`ChangeLog`] so the change-stream joiner has something to
//! consume.

use crate::stream::{ChangeLog, DEFAULT_RETENTION};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// A record-store item: a flat JSON object keyed by field name.
pub type Record = Map<String, Value>;

/// Errors returned by storage collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("no item with key '{0}'")]
    NotFound(String),
}

/// Identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

/// Blob storage for uploaded media.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket or location this store writes to
    fn location(&self) -> &str;

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<ObjectInfo, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete an object. Returns `false` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Key-indexed item storage.
///
/// Writes that leave an item unchanged are no-ops and must not produce a
/// change record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn location(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    /// Insert or replace an item.
    async fn put(&self, key: &str, record: Record) -> Result<(), StoreError>;

    /// Insert an item only if none exists. Returns `true` if inserted.
    async fn put_if_absent(&self, key: &str, record: Record) -> Result<bool, StoreError>;

    /// Set one field of an existing item. Returns `true` if the item changed.
    async fn update_field(&self, key: &str, field: &str, value: Value) -> Result<bool, StoreError>;

    /// Remove an item. Returns `false` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.contains('\0') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// In-memory [`ObjectStore`].
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn location(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<ObjectInfo, StoreError> {
        validate_key(key)?;
        let size = data.len() as u64;
        self.lock().insert(key.to_string(), data);
        debug!(bucket = %self.bucket, key = %key, size = size, "Object stored");
        Ok(ObjectInfo {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        Ok(self.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let existed = self.lock().remove(key).is_some();
        debug!(bucket = %self.bucket, key = %key, existed = existed, "Object deleted");
        Ok(existed)
    }
}

/// In-memory [`RecordStore`] with a change stream.
///
/// Every effective mutation appends one change record, under the item lock,
/// so the stream order matches mutation order.
pub struct MemoryRecordStore {
    table: String,
    items: Mutex<HashMap<String, Record>>,
    changes: Arc<ChangeLog>,
}

impl MemoryRecordStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self::with_stream_retention(table, DEFAULT_RETENTION)
    }

    /// A store whose change stream keeps at most `retention` records.
    pub fn with_stream_retention(table: impl Into<String>, retention: usize) -> Self {
        let table = table.into();
        let changes = Arc::new(ChangeLog::with_retention(format!("{}/stream", table), retention));
        Self {
            table,
            items: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// The change stream fed by this store.
    pub fn changes(&self) -> Arc<ChangeLog> {
        self.changes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(
        &self,
        items: &mut HashMap<String, Record>,
        key: &str,
        after: Option<Record>,
    ) -> bool {
        let before = match &after {
            Some(record) => items.insert(key.to_string(), record.clone()),
            None => items.remove(key),
        };
        if before == after {
            return false;
        }
        self.changes.append(key, before, after);
        true
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn location(&self) -> &str {
        &self.table
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        validate_key(key)?;
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, record: Record) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut items = self.lock();
        self.write(&mut items, key, Some(record));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, record: Record) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut items = self.lock();
        if items.contains_key(key) {
            return Ok(false);
        }
        Ok(self.write(&mut items, key, Some(record)))
    }

    async fn update_field(&self, key: &str, field: &str, value: Value) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut items = self.lock();
        let mut record = items
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        record.insert(field.to_string(), value);
        Ok(self.write(&mut items, key, Some(record)))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut items = self.lock();
        Ok(self.write(&mut items, key, None))
    }
}
