//! Shared sliding-window quotas across limiters, workers and jobs

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{task, test_config, Harness};
use syncflow_common::types::Record;
use syncflow_engine::config::RateLimitConfig;
use syncflow_engine::prelude::*;
use syncflow_engine::rate_limit::{Admission, InMemoryWindowStore, RateLimiter};
use syncflow_engine::source::RecordStream;

fn limited(quota: u32) -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        window_secs: 60,
        max_wait_ms: 0,
        plan_quotas: HashMap::from([("developer".to_string(), quota)]),
        default_quota: quota,
        scope_quotas: HashMap::new(),
    }
}

#[tokio::test]
async fn test_limiters_sharing_a_store_share_the_quota() {
    let store = Arc::new(InMemoryWindowStore::new());
    let first = Arc::new(RateLimiter::new(store.clone(), limited(5)));
    let second = Arc::new(RateLimiter::new(store.clone(), limited(5)));
    let org = Uuid::new_v4();
    let cancel = CancellationToken::new();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..20 {
        let limiter = if i % 2 == 0 { first.clone() } else { second.clone() };
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let scope = limiter.source_scope(org, "developer", "asana");
            limiter.acquire(&scope, Duration::ZERO, &cancel).await.unwrap()
        });
    }

    let mut granted = 0;
    while let Some(admission) = tasks.join_next().await {
        if admission.unwrap() == Admission::Granted {
            granted += 1;
        }
    }
    assert_eq!(granted, 5);
    assert_eq!(store.token_count(&format!("ratelimit:{org}:asana")), 5);
}

#[tokio::test]
async fn test_organizations_have_independent_windows() {
    let limiter = RateLimiter::in_memory(limited(1));
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let scope = limiter.source_scope(Uuid::new_v4(), "developer", "asana");
        assert_eq!(
            limiter.acquire(&scope, Duration::ZERO, &cancel).await.unwrap(),
            Admission::Granted
        );
    }
}

/// Source that calls back into its API for every record
struct EnrichingSource {
    inner: VecSource,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Source for EnrichingSource {
    fn name(&self) -> &str {
        "asana"
    }

    async fn records(&self, cursor: Option<DateTime<Utc>>) -> SyncResult<RecordStream> {
        self.inner.records(cursor).await
    }

    fn enriches(&self) -> bool {
        true
    }

    async fn enrich(&self, mut record: Record) -> SyncResult<Record> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        record.payload["assignee"] = serde_json::json!("ops");
        Ok(record)
    }
}

fn tasks(count: usize) -> Vec<Record> {
    (0..count).map(|i| task(&format!("t{i}"), "Quota bound")).collect()
}

#[tokio::test]
async fn test_exhausted_quota_stops_enrichment_calls() {
    let mut config = test_config(2, 4);
    config.rate_limit = limited(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let harness = Harness::with_connectors(config, Vec::new(), move |connectors| {
        connectors.register_source("enriching", move |_: &ConnectorRef| -> SyncResult<Arc<dyn Source>> {
            let source: Arc<dyn Source> = Arc::new(EnrichingSource {
                inner: VecSource::new("asana", tasks(5)),
                calls: counter.clone(),
            });
            Ok(source)
        });
    });
    let spec = JobSpec::new(
        harness.organization_id,
        ConnectorRef::new("enriching"),
        ConnectorRef::new("memory"),
    );

    let report = harness.run(spec).await;

    // one token opens the source, two records get enriched
    assert_eq!(report.status(), JobStatus::Succeeded);
    assert_eq!(report.snapshot.produced, 5);
    assert_eq!(report.snapshot.inserted, 2);
    assert_eq!(report.snapshot.skipped, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.memory.len().await, 2);
}

#[tokio::test]
async fn test_passive_source_is_not_throttled_per_record() {
    let mut config = test_config(4, 8);
    config.rate_limit = limited(1);
    let harness = Harness::new(config, tasks(100));

    let report = harness.run(harness.spec("memory")).await;

    // the single token is spent opening the source
    assert_eq!(report.status(), JobStatus::Succeeded);
    assert_eq!(report.snapshot.produced, 100);
    assert_eq!(report.snapshot.inserted, 100);
    assert_eq!(report.snapshot.skipped, 0);
    assert_eq!(harness.memory.len().await, 100);
}
