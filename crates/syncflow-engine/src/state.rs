//! Per-sync state carried between runs
//!
//! [`EntityStateStore`] remembers the content hash last written for every
//! record key, which is what makes unchanged records `kept` on a re-run. Each
//! entry also remembers the source record it was derived from, so a source
//! record that fails or is dropped can keep its stored descendants alive.
//! [`CursorStore`] holds the incremental-sync cursor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use syncflow_common::types::{ContentHash, RecordKey};

use crate::error::{SyncError, SyncResult};

#[async_trait]
pub trait EntityStateStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> SyncResult<Option<ContentHash>>;

    /// Store `hash` for `key`, a record derived from source record `origin`
    async fn put(&self, key: &RecordKey, origin: &RecordKey, hash: &ContentHash) -> SyncResult<()>;

    async fn remove(&self, keys: &[RecordKey]) -> SyncResult<()>;

    /// Every key currently known
    async fn keys(&self) -> SyncResult<Vec<RecordKey>>;

    /// Keys stored for records derived from source record `origin`
    async fn lineage(&self, origin: &RecordKey) -> SyncResult<Vec<RecordKey>>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> SyncResult<Option<DateTime<Utc>>>;

    async fn save(&self, cursor: DateTime<Utc>) -> SyncResult<()>;
}

/// Hands out the state of one sync (organization, source, destination)
pub trait StateProvider: Send + Sync {
    fn entity_state(&self, sync_id: Uuid) -> SyncResult<Arc<dyn EntityStateStore>>;

    fn cursor(&self, sync_id: Uuid) -> SyncResult<Arc<dyn CursorStore>>;
}

fn poisoned() -> SyncError {
    SyncError::Internal("state store lock poisoned".to_string())
}

#[derive(Debug, Clone)]
struct StateEntry {
    hash: ContentHash,
    origin: RecordKey,
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<RecordKey, StateEntry>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStateStore for InMemoryStateStore {
    async fn get(&self, key: &RecordKey) -> SyncResult<Option<ContentHash>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).map(|entry| entry.hash.clone()))
    }

    async fn put(&self, key: &RecordKey, origin: &RecordKey, hash: &ContentHash) -> SyncResult<()> {
        let entry = StateEntry {
            hash: hash.clone(),
            origin: origin.clone(),
        };
        self.entries.write().map_err(|_| poisoned())?.insert(key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, keys: &[RecordKey]) -> SyncResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self) -> SyncResult<Vec<RecordKey>> {
        Ok(self.entries.read().map_err(|_| poisoned())?.keys().cloned().collect())
    }

    async fn lineage(&self, origin: &RecordKey) -> SyncResult<Vec<RecordKey>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .iter()
            .filter(|(_, entry)| &entry.origin == origin)
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursor: RwLock<Option<DateTime<Utc>>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(*self.cursor.read().map_err(|_| poisoned())?)
    }

    async fn save(&self, cursor: DateTime<Utc>) -> SyncResult<()> {
        let mut current = self.cursor.write().map_err(|_| poisoned())?;
        // Never move the cursor backwards
        if current.is_none_or(|c| cursor > c) {
            *current = Some(cursor);
        }
        Ok(())
    }
}

/// Keeps every sync's state in process memory
#[derive(Debug, Default)]
pub struct InMemoryStateProvider {
    entities: Mutex<HashMap<Uuid, Arc<InMemoryStateStore>>>,
    cursors: Mutex<HashMap<Uuid, Arc<InMemoryCursorStore>>>,
}

impl InMemoryStateProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateProvider for InMemoryStateProvider {
    fn entity_state(&self, sync_id: Uuid) -> SyncResult<Arc<dyn EntityStateStore>> {
        let mut entities = self.entities.lock().map_err(|_| poisoned())?;
        let store: Arc<dyn EntityStateStore> = entities.entry(sync_id).or_default().clone();
        Ok(store)
    }

    fn cursor(&self, sync_id: Uuid) -> SyncResult<Arc<dyn CursorStore>> {
        let mut cursors = self.cursors.lock().map_err(|_| poisoned())?;
        let store: Arc<dyn CursorStore> = cursors.entry(sync_id).or_default().clone();
        Ok(store)
    }
}
