//! Shared fixtures for engine integration tests
//!
//! [`Harness`] wires a [`SyncService`] with in-memory state, an in-memory
//! destination registered as `memory`, a mutable record set served by the
//! `vec` source, and a toggleable liveness check.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use syncflow_common::types::{Record, RecordKey};
use syncflow_engine::config::{ProgressConfig, RateLimitConfig, RetryPolicy, SyncConfig};
use syncflow_engine::destination::{Destination, InMemoryDestination, VectorPoint};
use syncflow_engine::prelude::*;

pub const DIMENSIONS: usize = 32;

/// Fast retries, no rate limiting, eager progress
pub fn test_config(workers: usize, capacity: usize) -> SyncConfig {
    SyncConfig {
        worker_count: workers,
        stream_capacity: Some(capacity),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 5,
        },
        rate_limit: RateLimitConfig {
            enabled: false,
            ..Default::default()
        },
        progress: ProgressConfig {
            flush_interval_ms: 10,
            flush_every: 1,
            channel_capacity: 1024,
        },
        liveness_interval_secs: 1,
        ..Default::default()
    }
}

pub fn task(id: &str, content: &str) -> Record {
    Record::new(
        RecordKey::new(id),
        "task",
        serde_json::json!({ "title": format!("Task {id}"), "content": content }),
    )
}

pub struct Harness {
    pub service: SyncService,
    pub memory: Arc<InMemoryDestination>,
    pub liveness: Arc<StaticLiveness>,
    pub records: Arc<RwLock<Vec<Record>>>,
    pub organization_id: uuid::Uuid,
    pub sync_id: uuid::Uuid,
}

impl Harness {
    pub fn new(config: SyncConfig, records: Vec<Record>) -> Self {
        Self::with_connectors(config, records, |_| {})
    }

    /// Build with extra connectors registered on top of `vec` and `memory`
    pub fn with_connectors(
        config: SyncConfig,
        records: Vec<Record>,
        register: impl FnOnce(&mut ConnectorRegistry),
    ) -> Self {
        let config = Arc::new(config);
        let liveness = Arc::new(StaticLiveness::default());
        let supervisor = Arc::new(JobSupervisor::new(
            config.clone(),
            Arc::new(RateLimiter::in_memory(config.rate_limit.clone())),
            Arc::new(ProgressHub::new(config.progress.channel_capacity)),
            liveness.clone(),
        ));

        let records = Arc::new(RwLock::new(records));
        let memory = Arc::new(InMemoryDestination::new(DIMENSIONS));

        let mut connectors = ConnectorRegistry::with_builtins();
        let shared = records.clone();
        connectors.register_source("vec", move |_: &ConnectorRef| -> SyncResult<Arc<dyn Source>> {
            let snapshot = shared.read().unwrap().clone();
            let source: Arc<dyn Source> = Arc::new(VecSource::new("vec", snapshot));
            Ok(source)
        });
        connectors.register_memory_destination("memory", memory.clone());
        register(&mut connectors);

        let service = SyncService::new(
            supervisor,
            connectors,
            NodeRegistry::with_builtins(),
            Arc::new(InMemoryStateProvider::new()),
            Arc::new(HashingEmbedder::new(DIMENSIONS)),
        );

        Self {
            service,
            memory,
            liveness,
            records,
            organization_id: uuid::Uuid::new_v4(),
            sync_id: uuid::Uuid::new_v4(),
        }
    }

    /// Spec for `vec` into `destination`, sharing this harness's sync identity
    pub fn spec(&self, destination: &str) -> JobSpec {
        JobSpec::new(
            self.organization_id,
            ConnectorRef::new("vec"),
            ConnectorRef::new(destination),
        )
        .with_sync_id(self.sync_id)
    }

    pub async fn run(&self, spec: JobSpec) -> JobReport {
        let job_id = self.service.start(spec).unwrap();
        self.service.wait(job_id).await.unwrap()
    }

    pub fn set_records(&self, records: Vec<Record>) {
        *self.records.write().unwrap() = records;
    }
}

/// Destination that delays each write and tracks write concurrency
#[derive(Debug)]
pub struct SlowDestination {
    pub inner: Arc<InMemoryDestination>,
    pub delay: Duration,
    active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl SlowDestination {
    pub fn new(inner: Arc<InMemoryDestination>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Destination for SlowDestination {
    fn name(&self) -> &str {
        "slow"
    }

    async fn upsert(&self, batch: Vec<VectorPoint>) -> SyncResult<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.upsert(batch).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete(&self, keys: &[RecordKey]) -> SyncResult<()> {
        self.inner.delete(keys).await
    }
}

/// Destination failing every write with a fixed error
#[derive(Debug)]
pub struct FailingDestination {
    pub error: SyncError,
    pub calls: AtomicUsize,
}

impl FailingDestination {
    pub fn new(error: SyncError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Destination for FailingDestination {
    fn name(&self) -> &str {
        "failing"
    }

    async fn upsert(&self, _batch: Vec<VectorPoint>) -> SyncResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }

    async fn delete(&self, _keys: &[RecordKey]) -> SyncResult<()> {
        Err(self.error.clone())
    }
}

pub fn register_shared<D: Destination + 'static>(
    connectors: &mut ConnectorRegistry,
    kind: &str,
    destination: Arc<D>,
) {
    connectors.register_destination(kind, move |_: &ConnectorRef| -> SyncResult<Arc<dyn Destination>> {
        let destination: Arc<dyn Destination> = destination.clone();
        Ok(destination)
    });
}
