//! Per-record pipeline: enrich, route, vectorize, persist
//!
//! Stages run strictly in order for one record. Every external call goes
//! through the rate limiter and the retry wrapper. Per-record errors end as a
//! `failed` or `skipped` outcome; only fatal errors (unrecoverable auth,
//! configuration) are escalated, which cancels the whole job.
//!
//! A source record that does not reach persistence (failed enrich, routing
//! error, dropped by the graph) still counts as present upstream: its key and
//! every stored key derived from it are marked seen, so cleanup leaves them.

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use syncflow_common::types::{ContentHash, Record, RecordKey};

use crate::collection::TENANT_FIELD;
use crate::destination::{Destination, VectorPoint};
use crate::embedding::Embedder;
use crate::error::{Stage, SyncError, SyncResult};
use crate::graph::TransformGraph;
use crate::progress::Outcome;
use crate::rate_limit::{RateLimiter, RateScope};
use crate::retry::{CredentialRefresher, Retrier};
use crate::source::Source;
use crate::state::EntityStateStore;

/// First fatal error of a job; raising it cancels the job
#[derive(Debug)]
pub struct Escalation {
    reason: OnceLock<SyncError>,
    cancel: CancellationToken,
}

impl Escalation {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            reason: OnceLock::new(),
            cancel,
        }
    }

    /// Record `err` as the job's failure reason and cancel; only the first one sticks
    pub fn escalate(&self, err: SyncError) -> bool {
        let first = self.reason.set(err).is_ok();
        self.cancel.cancel();
        first
    }

    pub fn reason(&self) -> Option<&SyncError> {
        self.reason.get()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Rate-limit scopes for each kind of external call
#[derive(Debug, Clone)]
pub struct CallScopes {
    pub source: RateScope,
    pub embedding: RateScope,
    pub destination: RateScope,
}

/// Collaborators a processor is built from
pub struct ProcessorParts {
    pub job_id: Uuid,
    /// Logical collection written into every point's payload
    pub collection_id: String,
    pub source: Arc<dyn Source>,
    pub destination: Arc<dyn Destination>,
    pub embedder: Arc<dyn Embedder>,
    pub graph: Arc<TransformGraph>,
    pub state: Arc<dyn EntityStateStore>,
    pub limiter: Arc<RateLimiter>,
    pub scopes: CallScopes,
    pub retrier: Retrier,
    pub escalation: Arc<Escalation>,
}

/// What happened to one source record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// One outcome per terminal record, or a single `Skipped` if the graph dropped it
    pub outcomes: Vec<Outcome>,
    /// The job was cancelled before the record finished; nothing is counted
    pub abandoned: bool,
}

impl ProcessReport {
    fn single(outcome: Outcome) -> Self {
        Self {
            outcomes: vec![outcome],
            abandoned: false,
        }
    }

    fn abandoned() -> Self {
        Self {
            outcomes: Vec::new(),
            abandoned: true,
        }
    }
}

/// A terminal record whose content differs from what the destination holds
struct PendingWrite {
    record: Record,
    hash: ContentHash,
    outcome: Outcome,
}

pub struct EntityProcessor {
    job_id: Uuid,
    collection_id: String,
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    embedder: Arc<dyn Embedder>,
    graph: Arc<TransformGraph>,
    state: Arc<dyn EntityStateStore>,
    limiter: Arc<RateLimiter>,
    scopes: CallScopes,
    retrier: Retrier,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    escalation: Arc<Escalation>,
    seen: Mutex<HashSet<RecordKey>>,
    /// Set when a record's stored descendants could not be looked up
    lineage_unknown: AtomicBool,
}

impl std::fmt::Debug for EntityProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityProcessor")
            .field("job_id", &self.job_id)
            .field("source", &self.source.name())
            .field("destination", &self.destination.name())
            .field("embedder", &self.embedder.name())
            .finish()
    }
}

impl EntityProcessor {
    pub fn new(parts: ProcessorParts) -> Self {
        let refresher = parts.source.credential_refresher();
        Self {
            job_id: parts.job_id,
            collection_id: parts.collection_id,
            source: parts.source,
            destination: parts.destination,
            embedder: parts.embedder,
            graph: parts.graph,
            state: parts.state,
            limiter: parts.limiter,
            scopes: parts.scopes,
            retrier: parts.retrier,
            refresher,
            escalation: parts.escalation,
            seen: Mutex::new(HashSet::new()),
            lineage_unknown: AtomicBool::new(false),
        }
    }

    /// Run one record through all stages
    pub async fn process(&self, record: Record) -> ProcessReport {
        let key = record.key.clone();
        let record_type = record.record_type.clone();

        let enriched = match self.enrich(record).await {
            Ok(record) => record,
            Err(err) => {
                self.retain_lineage(&key).await;
                return self.fail_single(&key, &record_type, Stage::Enrich, err, Outcome::Skipped);
            },
        };

        let terminals = match self.graph.execute(enriched) {
            Ok(terminals) => terminals,
            Err(err) => {
                self.retain_lineage(&key).await;
                let outcome = match err {
                    SyncError::Validation(_) => Outcome::Skipped,
                    _ => Outcome::Failed,
                };
                return self.fail_single(&key, &record_type, Stage::Route, err, outcome);
            },
        };
        if terminals.is_empty() {
            tracing::debug!(job_id = %self.job_id, record_key = %key, "Record dropped by transform graph");
            self.retain_lineage(&key).await;
            return ProcessReport::single(Outcome::Skipped);
        }

        if let Err(err) = self.mark_seen(terminals.iter().map(|r| r.key.clone())) {
            self.escalate(err);
            return ProcessReport::single(Outcome::Failed);
        }
        self.persist_terminals(&key, terminals).await
    }

    async fn enrich(&self, record: Record) -> SyncResult<Record> {
        if record.key.is_empty() {
            return Err(SyncError::Validation("record has an empty key".to_string()));
        }
        if record.record_type.trim().is_empty() {
            return Err(SyncError::Validation(format!("record {} has no type", record.key)));
        }
        if let Some(crumb) = record.breadcrumbs.iter().find(|b| b.key.is_empty()) {
            return Err(SyncError::Validation(format!(
                "record {} has a breadcrumb of type {} without a key",
                record.key, crumb.record_type
            )));
        }

        if !self.source.enriches() {
            return Ok(with_created_at(record));
        }

        let enriched = self
            .call("enrich", &self.scopes.source, self.refresher.as_deref(), || {
                self.source.enrich(record.clone())
            })
            .await?;

        if enriched.key != record.key {
            return Err(SyncError::Validation(format!(
                "enrich changed the key of record {} to {}",
                record.key, enriched.key
            )));
        }
        Ok(with_created_at(enriched))
    }

    /// Classify, vectorize and write the terminal records of one source record
    async fn persist_terminals(&self, origin: &RecordKey, terminals: Vec<Record>) -> ProcessReport {
        let mut outcomes = Vec::with_capacity(terminals.len());
        let mut pending = Vec::new();

        for record in terminals {
            match self.classify(&record).await {
                Ok((Outcome::Kept, _)) => outcomes.push(Outcome::Kept),
                Ok((outcome, hash)) => pending.push(PendingWrite { record, hash, outcome }),
                Err(err) => outcomes.push(self.record_failure(&record, Stage::Persist, err)),
            }
        }

        if pending.is_empty() {
            return ProcessReport {
                outcomes,
                abandoned: false,
            };
        }

        // Records without embeddable text are skipped, the rest are embedded together
        let mut texts = Vec::with_capacity(pending.len());
        let mut writable = Vec::with_capacity(pending.len());
        for write in pending {
            match write.record.embeddable_text() {
                Ok(text) => {
                    texts.push(text);
                    writable.push(write);
                },
                Err(err) => outcomes.push(self.record_failure(&write.record, Stage::Vectorize, err.into())),
            }
        }
        if writable.is_empty() {
            return ProcessReport {
                outcomes,
                abandoned: false,
            };
        }

        let vectors = match self.vectorize(&texts).await {
            Ok(vectors) => vectors,
            Err(SyncError::Cancelled) => return ProcessReport::abandoned(),
            Err(err) => {
                for write in &writable {
                    outcomes.push(self.record_failure(&write.record, Stage::Vectorize, err.clone()));
                }
                return ProcessReport {
                    outcomes,
                    abandoned: false,
                };
            },
        };

        let points: Vec<VectorPoint> = writable
            .iter()
            .zip(vectors)
            .map(|(write, vector)| VectorPoint {
                key: write.record.key.clone(),
                vector,
                payload: self.point_payload(&write.record, &write.hash),
            })
            .collect();

        match self
            .call("upsert", &self.scopes.destination, None, || {
                self.destination.upsert(points.clone())
            })
            .await
        {
            Ok(()) => {
                for write in writable {
                    if let Err(err) = self.state.put(&write.record.key, origin, &write.hash).await {
                        // Point is written; the next run rewrites it as updated
                        tracing::warn!(
                            job_id = %self.job_id,
                            record_key = %write.record.key,
                            error = %err,
                            "Failed to store content hash"
                        );
                    }
                    outcomes.push(write.outcome);
                }
            },
            Err(SyncError::Cancelled) => return ProcessReport::abandoned(),
            Err(err) => {
                for write in &writable {
                    outcomes.push(self.record_failure(&write.record, Stage::Persist, err.clone()));
                }
            },
        }

        ProcessReport {
            outcomes,
            abandoned: false,
        }
    }

    /// Compare against the stored hash: new key, changed or unchanged content
    async fn classify(&self, record: &Record) -> SyncResult<(Outcome, ContentHash)> {
        let hash = record.content_hash()?;
        let outcome = match self.state.get(&record.key).await? {
            None => Outcome::Inserted,
            Some(previous) if previous == hash => Outcome::Kept,
            Some(_) => Outcome::Updated,
        };
        Ok((outcome, hash))
    }

    /// Embed in batches no larger than the embedder accepts
    async fn vectorize(&self, texts: &[String]) -> SyncResult<Vec<Vec<f32>>> {
        let batch_size = self.embedder.max_batch_size().max(1);
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size) {
            let embedded = self
                .call("embed", &self.scopes.embedding, None, || self.embedder.embed(batch))
                .await?;
            if embedded.len() != batch.len() {
                return Err(SyncError::Internal(format!(
                    "embedder returned {} vectors for {} texts",
                    embedded.len(),
                    batch.len()
                )));
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    fn point_payload(&self, record: &Record, hash: &ContentHash) -> serde_json::Value {
        serde_json::json!({
            TENANT_FIELD: self.collection_id,
            "record_type": record.record_type,
            "breadcrumbs": record.breadcrumbs,
            "payload": record.payload,
            "content_hash": hash,
            "created_at": record.created_at,
            "updated_at": record.updated_at,
            "sync_job_id": self.job_id,
            "synced_at": Utc::now(),
        })
    }

    /// Rate-limited, retried external call
    async fn call<T, F, Fut>(
        &self,
        label: &str,
        scope: &RateScope,
        refresher: Option<&dyn CredentialRefresher>,
        mut op: F,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let cancel = self.escalation.token();
        self.retrier
            .run(label, refresher, || {
                let attempt = op();
                async move {
                    self.limiter.admit(scope, cancel).await?;
                    attempt.await
                }
            })
            .await
    }

    fn fail_single(
        &self,
        key: &RecordKey,
        record_type: &str,
        stage: Stage,
        err: SyncError,
        outcome: Outcome,
    ) -> ProcessReport {
        if matches!(err, SyncError::Cancelled) {
            return ProcessReport::abandoned();
        }
        self.log_failure(key, record_type, stage, &err);
        if err.is_fatal() {
            self.escalate(err);
            return ProcessReport::single(Outcome::Failed);
        }
        ProcessReport::single(outcome)
    }

    /// Log a terminal record's failure and pick its outcome
    fn record_failure(&self, record: &Record, stage: Stage, err: SyncError) -> Outcome {
        self.log_failure(&record.key, &record.record_type, stage, &err);
        match err {
            SyncError::Validation(_) => Outcome::Skipped,
            err if err.is_fatal() => {
                self.escalate(err);
                Outcome::Failed
            },
            _ => Outcome::Failed,
        }
    }

    fn log_failure(&self, key: &RecordKey, record_type: &str, stage: Stage, err: &SyncError) {
        tracing::warn!(
            job_id = %self.job_id,
            record_key = %key,
            record_type,
            stage = %stage,
            error_kind = err.kind(),
            error = %err,
            "Record failed"
        );
    }

    fn escalate(&self, err: SyncError) {
        tracing::error!(job_id = %self.job_id, error_kind = err.kind(), error = %err, "Escalating fatal error");
        self.escalation.escalate(err);
    }

    fn mark_seen(&self, keys: impl Iterator<Item = RecordKey>) -> SyncResult<()> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| SyncError::Internal("seen-key set lock poisoned".to_string()))?;
        seen.extend(keys);
        Ok(())
    }

    /// Keep a source record and everything stored from it out of cleanup
    async fn retain_lineage(&self, origin: &RecordKey) {
        let stored = match self.state.lineage(origin).await {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    record_key = %origin,
                    error = %err,
                    "Cannot look up stored descendants, cleanup disabled for this run"
                );
                self.lineage_unknown.store(true, Ordering::SeqCst);
                Vec::new()
            },
        };
        if let Err(err) = self.mark_seen(std::iter::once(origin.clone()).chain(stored)) {
            self.escalate(err);
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Delete destination points whose keys this run never produced
    ///
    /// Returns the number of deleted keys.
    pub async fn cleanup(&self) -> SyncResult<u64> {
        if self.lineage_unknown.load(Ordering::SeqCst) {
            tracing::warn!(job_id = %self.job_id, "Skipping cleanup, some live records could not be traced");
            return Ok(0);
        }
        let known = self.state.keys().await?;
        let stale: Vec<RecordKey> = {
            let seen = self
                .seen
                .lock()
                .map_err(|_| SyncError::Internal("seen-key set lock poisoned".to_string()))?;
            known.into_iter().filter(|k| !seen.contains(k)).collect()
        };
        if stale.is_empty() {
            return Ok(0);
        }

        self.call("delete", &self.scopes.destination, None, || {
            self.destination.delete(&stale)
        })
        .await?;
        self.state.remove(&stale).await?;

        tracing::info!(job_id = %self.job_id, deleted = stale.len(), "Removed stale records");
        Ok(stale.len() as u64)
    }
}

/// Fall back to the modification time when the source gives no creation time
fn with_created_at(mut record: Record) -> Record {
    if record.created_at.is_none() {
        record.created_at = record.updated_at;
    }
    record
}
