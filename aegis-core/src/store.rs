//! Persistence boundary for the offline action queue.
//!
//! A pluggable `{get, set, remove}` key-value store. The durable backend is
//! redb; `ResilientStore` wraps any backend so that the first storage error
//! (private browsing, quota exceeded, corrupt file) degrades the store to
//! in-memory operation instead of propagating into business logic. Nothing
//! above this module ever sees a storage error.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use crate::error::{AegisError, AegisResult};

/// Minimal key-value store contract. Implementations must be cheap enough
/// to call on the hot path; values are opaque strings.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> AegisResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AegisResult<()>;
    fn remove(&self, key: &str) -> AegisResult<()>;
}

/// Infallible in-memory store; the degradation target.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> AegisResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AegisResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AegisResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("aegis_kv");

/// Durable store backed by a single-table redb database.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    pub fn open(path: impl AsRef<Path>) -> AegisResult<Self> {
        let db = Database::create(path.as_ref())
            .map_err(|e| AegisError::storage("kv open", e))?;
        Ok(Self { db })
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &str) -> AegisResult<Option<String>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| AegisError::storage("kv get", e))?;
        let table = match txn.open_table(KV_TABLE) {
            Ok(table) => table,
            // Nothing written yet.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(AegisError::storage("kv get", e)),
        };
        let value = table
            .get(key)
            .map_err(|e| AegisError::storage("kv get", e))?;
        Ok(value.map(|guard| guard.value().to_string()))
    }

    fn set(&self, key: &str, value: &str) -> AegisResult<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| AegisError::storage("kv set", e))?;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| AegisError::storage("kv set", e))?;
            table
                .insert(key, value)
                .map_err(|e| AegisError::storage("kv set", e))?;
        }
        txn.commit().map_err(|e| AegisError::storage("kv set", e))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> AegisResult<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| AegisError::storage("kv remove", e))?;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| AegisError::storage("kv remove", e))?;
            table
                .remove(key)
                .map_err(|e| AegisError::storage("kv remove", e))?;
        }
        txn.commit()
            .map_err(|e| AegisError::storage("kv remove", e))?;
        Ok(())
    }
}

/// Capability-checked adapter over a primary backend.
///
/// Writes are mirrored to memory so the fallback view stays current; the
/// first primary failure logs a warning and flips the store to memory-only
/// for the rest of the process lifetime. The `KvStore` impl here never
/// returns an error.
pub struct ResilientStore {
    primary: Option<Box<dyn KvStore>>,
    memory: MemoryStore,
    degraded: AtomicBool,
}

impl ResilientStore {
    pub fn new(primary: Box<dyn KvStore>) -> Self {
        Self {
            primary: Some(primary),
            memory: MemoryStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Store with no durable backend at all (tests, restricted contexts).
    pub fn memory_only() -> Self {
        Self {
            primary: None,
            memory: MemoryStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.primary.is_none() || self.degraded.load(Ordering::Acquire)
    }

    fn degrade(&self, operation: &str, error: &AegisError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                operation,
                error = %error,
                "persistent storage unavailable, degrading to in-memory queue state"
            );
        } else {
            debug!(operation, error = %error, "storage error after degradation");
        }
    }

    fn primary(&self) -> Option<&dyn KvStore> {
        if self.degraded.load(Ordering::Acquire) {
            return None;
        }
        self.primary.as_deref()
    }
}

impl KvStore for ResilientStore {
    fn get(&self, key: &str) -> AegisResult<Option<String>> {
        if let Some(primary) = self.primary() {
            match primary.get(key) {
                Ok(value) => return Ok(value),
                Err(e) => self.degrade("get", &e),
            }
        }
        self.memory.get(key)
    }

    fn set(&self, key: &str, value: &str) -> AegisResult<()> {
        // Mirror first so a mid-call degradation still sees this write.
        let _ = self.memory.set(key, value);
        if let Some(primary) = self.primary() {
            if let Err(e) = primary.set(key, value) {
                self.degrade("set", &e);
            }
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> AegisResult<()> {
        let _ = self.memory.remove(key);
        if let Some(primary) = self.primary() {
            if let Err(e) = primary.remove(key) {
                self.degrade("remove", &e);
            }
        }
        Ok(())
    }
}

/// Backend that fails every call, like storage in private browsing.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
impl KvStore for FailingStore {
    fn get(&self, _key: &str) -> AegisResult<Option<String>> {
        Err(AegisError::storage(
            "kv get",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "quota exceeded"),
        ))
    }

    fn set(&self, _key: &str, _value: &str) -> AegisResult<()> {
        Err(AegisError::storage(
            "kv set",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "quota exceeded"),
        ))
    }

    fn remove(&self, _key: &str) -> AegisResult<()> {
        Err(AegisError::storage(
            "kv remove",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "quota exceeded"),
        ))
    }
}
