//! Destination connectors
//!
//! A destination accepts batches of vector points keyed by record identity.
//! Upserts must be idempotent: writing the same key twice leaves one point.
//! Any write serialization the underlying store needs is the destination's
//! own business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use syncflow_common::types::RecordKey;

use crate::collection::physical_collection_name;
use crate::error::SyncResult;

/// One vector with its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub key: RecordKey,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Short name, also the rate-limit scope for writes
    fn name(&self) -> &str;

    async fn upsert(&self, batch: Vec<VectorPoint>) -> SyncResult<()>;

    async fn delete(&self, keys: &[RecordKey]) -> SyncResult<()>;
}

/// Destination keeping points in memory, one physical collection per instance
#[derive(Debug)]
pub struct InMemoryDestination {
    collection: String,
    points: Mutex<HashMap<RecordKey, VectorPoint>>,
    upsert_calls: AtomicUsize,
    written: AtomicUsize,
}

impl InMemoryDestination {
    pub fn new(dimensions: usize) -> Self {
        Self {
            collection: physical_collection_name(dimensions),
            points: Mutex::new(HashMap::new()),
            upsert_calls: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn len(&self) -> usize {
        self.points.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.lock().await.is_empty()
    }

    pub async fn get(&self, key: &str) -> Option<VectorPoint> {
        self.points.lock().await.get(&RecordKey::new(key)).cloned()
    }

    pub async fn keys(&self) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self.points.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of `upsert` calls received
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::Acquire)
    }

    /// Total points written across all upserts, rewrites included
    pub fn points_written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Destination for InMemoryDestination {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, batch: Vec<VectorPoint>) -> SyncResult<()> {
        self.upsert_calls.fetch_add(1, Ordering::AcqRel);
        self.written.fetch_add(batch.len(), Ordering::AcqRel);

        let mut points = self.points.lock().await;
        for point in batch {
            points.insert(point.key.clone(), point);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[RecordKey]) -> SyncResult<()> {
        let mut points = self.points.lock().await;
        for key in keys {
            points.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(key: &str, v: f32) -> VectorPoint {
        VectorPoint {
            key: RecordKey::new(key),
            vector: vec![v],
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_key() {
        let destination = InMemoryDestination::new(384);
        assert_eq!(destination.collection(), "shared_minilm_l6_v2");

        destination.upsert(vec![point("a", 1.0), point("b", 1.0)]).await.unwrap();
        destination.upsert(vec![point("a", 2.0)]).await.unwrap();

        assert_eq!(destination.len().await, 2);
        assert_eq!(destination.get("a").await.unwrap().vector, vec![2.0]);
        assert_eq!(destination.upsert_calls(), 2);
        assert_eq!(destination.points_written(), 3);
    }

    #[tokio::test]
    async fn test_delete() {
        let destination = InMemoryDestination::new(8);
        destination.upsert(vec![point("a", 1.0), point("b", 1.0)]).await.unwrap();
        destination.delete(&[RecordKey::new("a"), RecordKey::new("zzz")]).await.unwrap();
        assert_eq!(destination.keys().await, vec![RecordKey::new("b")]);
    }
}
