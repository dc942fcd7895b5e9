//! Job lifecycle and wiring
//!
//! The supervisor owns a job's cancellation token. It runs the source
//! producer into the bounded stream concurrently with the worker pool, watches
//! the owner's liveness, and finalizes the job once the stream is drained and
//! every worker has exited.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use syncflow_common::types::Record;

use crate::config::SyncConfig;
use crate::destination::Destination;
use crate::embedding::Embedder;
use crate::error::{Stage, SyncError, SyncResult};
use crate::graph::TransformGraph;
use crate::liveness::OwnerLiveness;
use crate::processor::{CallScopes, EntityProcessor, Escalation, ProcessorParts};
use crate::progress::{Outcome, ProgressHub, ProgressSnapshot, ProgressTracker};
use crate::rate_limit::RateLimiter;
use crate::retry::Retrier;
use crate::source::{RecordStream, Source};
use crate::state::{CursorStore, EntityStateStore};
use crate::stream::{bounded, StreamProducer};
use crate::worker::{RecordHandler, WorkerPool};

// ============================================================================
// Job model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Orphaned,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Orphaned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a configured connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRef {
    /// Connection row id in the configuration store
    pub id: Uuid,
    /// Registered connector short name
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ConnectorRef {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// One sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Billing plan, selects the source rate-limit quota
    pub plan: String,
    pub source: ConnectorRef,
    pub destination: ConnectorRef,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        organization_id: Uuid,
        plan: impl Into<String>,
        source: ConnectorRef,
        destination: ConnectorRef,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            plan: plan.into(),
            source,
            destination,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`; terminal jobs never change again
    pub fn transition(&mut self, next: JobStatus) -> SyncResult<()> {
        if self.status.is_terminal() {
            return Err(SyncError::Internal(format!(
                "job {} is already {}, cannot become {}",
                self.id, self.status, next
            )));
        }
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }
}

/// Job shared between the supervisor and the control surface
pub type SharedJob = Arc<RwLock<Job>>;

/// Concurrency instrumentation of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub workers: usize,
    pub stream_capacity: usize,
    pub peak_in_flight: usize,
    pub stream_high_water: usize,
}

/// Final state of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: Job,
    pub snapshot: ProgressSnapshot,
    pub failure_reason: Option<String>,
    pub stats: RunStats,
}

impl JobReport {
    pub fn status(&self) -> JobStatus {
        self.job.status
    }
}

/// Everything one run needs besides the process-wide services
pub struct JobRun {
    pub job: SharedJob,
    /// Logical collection the points belong to
    pub collection_id: String,
    pub source: Arc<dyn Source>,
    pub destination: Arc<dyn Destination>,
    pub embedder: Arc<dyn Embedder>,
    pub graph: Arc<TransformGraph>,
    pub state: Arc<dyn EntityStateStore>,
    pub cursor: Arc<dyn CursorStore>,
    /// Only pull records changed since the stored cursor; skips stale-key cleanup
    pub incremental: bool,
}

// ============================================================================
// Supervisor
// ============================================================================

/// Process-wide services shared by every job
pub struct JobSupervisor {
    config: Arc<SyncConfig>,
    limiter: Arc<RateLimiter>,
    hub: Arc<ProgressHub>,
    liveness: Arc<dyn OwnerLiveness>,
}

impl std::fmt::Debug for JobSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSupervisor")
            .field("workers", &self.config.worker_count)
            .field("capacity", &self.config.stream_capacity())
            .finish()
    }
}

/// Worker-side glue: process a record, count its outcomes
struct CountingHandler {
    processor: Arc<EntityProcessor>,
    tracker: Arc<ProgressTracker>,
}

#[async_trait::async_trait]
impl RecordHandler for CountingHandler {
    async fn handle(&self, worker: usize, record: Record) {
        let key = record.key.clone();
        let report = self.processor.process(record).await;
        if report.abandoned {
            tracing::debug!(worker, record_key = %key, "Record abandoned on cancellation");
            return;
        }
        for outcome in report.outcomes {
            self.tracker.record(outcome);
        }
    }
}

/// What the producer task saw
#[derive(Debug, Default)]
struct ProducerSummary {
    pushed: u64,
    extraction_errors: u64,
    max_updated_at: Option<DateTime<Utc>>,
}

impl JobSupervisor {
    pub fn new(
        config: Arc<SyncConfig>,
        limiter: Arc<RateLimiter>,
        hub: Arc<ProgressHub>,
        liveness: Arc<dyn OwnerLiveness>,
    ) -> Self {
        Self {
            config,
            limiter,
            hub,
            liveness,
        }
    }

    pub fn hub(&self) -> Arc<ProgressHub> {
        self.hub.clone()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run a job to a terminal state
    pub async fn run(&self, run: JobRun, cancel: CancellationToken) -> JobReport {
        let job = read_job(&run.job);
        let job_id = job.id;

        if let Err(e) = update_job(&run.job, JobStatus::Running) {
            tracing::error!(job_id = %job_id, error = %e, "Job cannot start");
            return JobReport {
                job: read_job(&run.job),
                snapshot: ProgressSnapshot {
                    job_id,
                    ..Default::default()
                },
                failure_reason: Some(e.to_string()),
                stats: RunStats::default(),
            };
        }

        tracing::info!(
            job_id = %job_id,
            organization_id = %job.organization_id,
            source = run.source.name(),
            destination = run.destination.name(),
            workers = self.config.worker_count,
            capacity = self.config.stream_capacity(),
            incremental = run.incremental,
            "Sync job started"
        );

        let tracker = Arc::new(ProgressTracker::new(job_id, &self.config.progress, self.hub.clone()));
        let publisher = tracker.spawn_publisher();
        let escalation = Arc::new(Escalation::new(cancel.clone()));
        let retrier = Retrier::new(self.config.retry.clone(), cancel.clone());

        let orphaned = Arc::new(AtomicBool::new(false));
        let watchdog_stop = CancellationToken::new();
        let watchdog = self.spawn_watchdog(
            job.clone(),
            tracker.clone(),
            cancel.clone(),
            orphaned.clone(),
            watchdog_stop.clone(),
        );

        let scopes = CallScopes {
            source: self
                .limiter
                .source_scope(job.organization_id, &job.plan, run.source.name()),
            embedding: self
                .limiter
                .auxiliary_scope(job.organization_id, run.embedder.name()),
            destination: self
                .limiter
                .auxiliary_scope(job.organization_id, run.destination.name()),
        };

        let processor = Arc::new(EntityProcessor::new(ProcessorParts {
            job_id,
            collection_id: run.collection_id.clone(),
            source: run.source.clone(),
            destination: run.destination.clone(),
            embedder: run.embedder.clone(),
            graph: run.graph.clone(),
            state: run.state.clone(),
            limiter: self.limiter.clone(),
            scopes: scopes.clone(),
            retrier: retrier.clone(),
            escalation: escalation.clone(),
        }));

        let mut stats = RunStats {
            workers: self.config.worker_count,
            stream_capacity: self.config.stream_capacity(),
            ..Default::default()
        };
        let mut failure: Option<String> = None;

        let cursor = if run.incremental {
            match run.cursor.load().await {
                Ok(cursor) => cursor,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Cursor unavailable, running a full pull");
                    None
                },
            }
        } else {
            None
        };

        let refresher = run.source.credential_refresher();
        let (limiter, source_scope, source, token) = (&self.limiter, &scopes.source, &run.source, &cancel);
        let opened = retrier
            .run("open_source", refresher.as_deref(), || async move {
                limiter.admit(source_scope, token).await?;
                source.records(cursor).await
            })
            .await;

        let mut extraction_errors = 0;
        let mut max_updated_at = None;

        match opened {
            Ok(records) => {
                let (producer, consumer) = bounded(self.config.stream_capacity(), cancel.clone());
                let stream_stats = producer.stats();
                let pool = WorkerPool::new(self.config.worker_count, cancel.clone());
                let handler = Arc::new(CountingHandler {
                    processor: processor.clone(),
                    tracker: tracker.clone(),
                });

                let producer_task = tokio::spawn(produce(
                    job_id,
                    records,
                    producer,
                    tracker.clone(),
                    escalation.clone(),
                    cancel.clone(),
                ));
                let summary = pool.run(consumer, handler).await;

                match producer_task.await {
                    Ok(produced) => {
                        tracing::debug!(job_id = %job_id, pushed = produced.pushed, "Producer finished");
                        extraction_errors = produced.extraction_errors;
                        max_updated_at = produced.max_updated_at;
                    },
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Producer panicked");
                        failure = Some(format!("source producer panicked: {e}"));
                    },
                }

                if summary.panicked > 0 && failure.is_none() {
                    failure = Some(format!("{} workers panicked", summary.panicked));
                }
                stats.peak_in_flight = summary.peak_in_flight;
                stats.stream_high_water = stream_stats.high_water();
            },
            Err(SyncError::Cancelled) => {},
            Err(e) => {
                tracing::error!(job_id = %job_id, error_kind = e.kind(), error = %e, "Cannot open source");
                if e.is_fatal() {
                    escalation.escalate(e);
                } else {
                    failure = Some(format!("cannot open source: {e}"));
                }
            },
        }

        let status = if orphaned.load(Ordering::Acquire) {
            JobStatus::Orphaned
        } else if let Some(reason) = escalation.reason() {
            failure = Some(reason.to_string());
            JobStatus::Failed
        } else if cancel.is_cancelled() {
            JobStatus::Cancelled
        } else if failure.is_some() {
            JobStatus::Failed
        } else {
            let failed = tracker.snapshot().failed;
            let clean = failed == 0 && extraction_errors == 0;

            if clean && !run.incremental {
                match processor.cleanup().await {
                    Ok(deleted) => tracker.record_deleted(deleted),
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, stage = %Stage::Cleanup, error = %e, "Stale record cleanup failed");
                        if e.is_fatal() {
                            failure = Some(e.to_string());
                        }
                    },
                }
            } else if !clean {
                tracing::info!(
                    job_id = %job_id,
                    failed,
                    extraction_errors,
                    "Skipping stale record cleanup after failures"
                );
            }

            if clean {
                if let Some(cursor) = max_updated_at {
                    if let Err(e) = run.cursor.save(cursor).await {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to save sync cursor");
                    }
                }
            }

            if failure.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Succeeded
            }
        };

        watchdog_stop.cancel();
        if let Err(e) = watchdog.await {
            tracing::warn!(job_id = %job_id, error = %e, "Liveness watchdog panicked");
        }

        let snapshot = if status == JobStatus::Orphaned {
            tracker.suppress();
            tracker.snapshot()
        } else {
            tracker.finish().unwrap_or_else(|| tracker.snapshot())
        };
        if let Err(e) = publisher.await {
            tracing::warn!(job_id = %job_id, error = %e, "Progress publisher panicked");
        }

        if let Err(e) = update_job(&run.job, status) {
            tracing::error!(job_id = %job_id, error = %e, "Failed to finalize job");
        }

        match status {
            JobStatus::Succeeded => tracing::info!(
                job_id = %job_id,
                produced = snapshot.produced,
                inserted = snapshot.inserted,
                updated = snapshot.updated,
                kept = snapshot.kept,
                skipped = snapshot.skipped,
                failed = snapshot.failed,
                deleted = snapshot.deleted,
                "Sync job succeeded"
            ),
            JobStatus::Failed => tracing::error!(
                job_id = %job_id,
                reason = failure.as_deref().unwrap_or("unknown"),
                "Sync job failed"
            ),
            other => tracing::warn!(job_id = %job_id, status = %other, "Sync job stopped"),
        }

        JobReport {
            job: read_job(&run.job),
            snapshot,
            failure_reason: failure,
            stats,
        }
    }

    /// Poll owner liveness until stopped; on orphaning, suppress progress and cancel
    fn spawn_watchdog(
        &self,
        job: Job,
        tracker: Arc<ProgressTracker>,
        cancel: CancellationToken,
        orphaned: Arc<AtomicBool>,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let liveness = self.liveness.clone();
        let interval: Duration = self.config.liveness_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {},
                }
                match liveness.is_alive(&job).await {
                    Ok(true) => {},
                    Ok(false) => {
                        let err = SyncError::Orphaned(format!("source connection {} deleted", job.source.id));
                        tracing::warn!(job_id = %job.id, error_kind = err.kind(), error = %err, "Tearing down job");
                        orphaned.store(true, Ordering::Release);
                        tracker.suppress();
                        cancel.cancel();
                        break;
                    },
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Liveness check failed");
                    },
                }
            }
        })
    }
}

/// Pull from the source into the stream until exhausted or cancelled
async fn produce(
    job_id: Uuid,
    mut records: RecordStream,
    producer: StreamProducer,
    tracker: Arc<ProgressTracker>,
    escalation: Arc<Escalation>,
    cancel: CancellationToken,
) -> ProducerSummary {
    let mut summary = ProducerSummary::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = records.next() => next,
        };
        let Some(item) = next else { break };

        match item {
            Ok(record) => {
                let modified = record.last_modified();
                // Counted first so no snapshot shows outcomes ahead of produced
                tracker.record_produced();
                if producer.push(record).await.is_err() {
                    break;
                }
                summary.pushed += 1;
                if let Some(modified) = modified {
                    summary.max_updated_at = summary.max_updated_at.max(Some(modified));
                }
            },
            Err(SyncError::Cancelled) => break,
            Err(e) => {
                summary.extraction_errors += 1;
                tracker.record_produced();
                tracing::warn!(
                    job_id = %job_id,
                    stage = %Stage::Extract,
                    error_kind = e.kind(),
                    error = %e,
                    "Source yielded an error"
                );
                if e.is_fatal() {
                    tracker.record(Outcome::Failed);
                    escalation.escalate(e);
                    break;
                }
                let outcome = match e {
                    SyncError::Validation(_) => Outcome::Skipped,
                    _ => Outcome::Failed,
                };
                tracker.record(outcome);
            },
        }
    }

    producer.close();
    summary
}

fn read_job(job: &SharedJob) -> Job {
    match job.read() {
        Ok(job) => job.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn update_job(job: &SharedJob, status: JobStatus) -> SyncResult<()> {
    let mut job = job
        .write()
        .map_err(|_| SyncError::Internal("job lock poisoned".to_string()))?;
    job.transition(status)
}
