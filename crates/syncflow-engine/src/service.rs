//! Control surface: start, cancel, observe and await sync jobs
//!
//! A job is rejected before it starts when its transform graph does not build
//! or its connectors do not resolve. Accepted jobs run on their own task under
//! the shared [`JobSupervisor`].
//!
//! A job's progress channel is dropped once its report is out; the final
//! snapshot stays reachable through the report. Finished jobs are kept up to
//! `finished_job_retention`, oldest forgotten first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::{SyncError, SyncResult};
use crate::graph::{GraphConfig, NodeRegistry, TransformGraph};
use crate::progress::{ProgressSnapshot, ProgressSubscription};
use crate::registry::ConnectorRegistry;
use crate::state::StateProvider;
use crate::supervisor::{ConnectorRef, Job, JobReport, JobRun, JobStatus, JobSupervisor, SharedJob};

/// Request to start one sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub organization_id: Uuid,
    pub plan: String,
    /// Identity of the sync; runs with the same id share entity state and cursor
    pub sync_id: Uuid,
    pub collection_id: String,
    pub source: ConnectorRef,
    pub destination: ConnectorRef,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub incremental: bool,
}

impl JobSpec {
    pub fn new(organization_id: Uuid, source: ConnectorRef, destination: ConnectorRef) -> Self {
        Self {
            organization_id,
            plan: "developer".to_string(),
            sync_id: Uuid::new_v4(),
            collection_id: organization_id.to_string(),
            source,
            destination,
            graph: GraphConfig::default(),
            incremental: false,
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = plan.into();
        self
    }

    pub fn with_sync_id(mut self, sync_id: Uuid) -> Self {
        self.sync_id = sync_id;
        self
    }

    pub fn with_collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = collection_id.into();
        self
    }

    pub fn with_graph(mut self, graph: GraphConfig) -> Self {
        self.graph = graph;
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }
}

struct JobHandle {
    job: SharedJob,
    cancel: CancellationToken,
    report: watch::Receiver<Option<JobReport>>,
}

impl JobHandle {
    fn is_finished(&self) -> bool {
        self.report.borrow().is_some()
    }

    /// Last snapshot of a finished job; orphaned jobs publish none
    fn final_snapshot(&self) -> Option<ProgressSnapshot> {
        self.report
            .borrow()
            .as_ref()
            .filter(|report| report.status() != JobStatus::Orphaned)
            .map(|report| report.snapshot.clone())
    }

    fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.job.read().ok().and_then(|job| job.finished_at)
    }
}

pub struct SyncService {
    supervisor: Arc<JobSupervisor>,
    connectors: ConnectorRegistry,
    nodes: NodeRegistry,
    state: Arc<dyn StateProvider>,
    embedder: Arc<dyn Embedder>,
    jobs: RwLock<HashMap<Uuid, JobHandle>>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.jobs.read().map(|jobs| jobs.len()).unwrap_or_default();
        f.debug_struct("SyncService")
            .field("supervisor", &self.supervisor)
            .field("connectors", &self.connectors)
            .field("nodes", &self.nodes)
            .field("jobs", &jobs)
            .finish()
    }
}

fn unknown_job(job_id: Uuid) -> SyncError {
    SyncError::Internal(format!("unknown job {job_id}"))
}

fn poisoned_jobs() -> SyncError {
    SyncError::Internal("job table lock poisoned".to_string())
}

impl SyncService {
    pub fn new(
        supervisor: Arc<JobSupervisor>,
        connectors: ConnectorRegistry,
        nodes: NodeRegistry,
        state: Arc<dyn StateProvider>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            supervisor,
            connectors,
            nodes,
            state,
            embedder,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and launch a job
    ///
    /// Graph and connector problems are returned as `Configuration` errors
    /// and no job is created.
    pub fn start(&self, spec: JobSpec) -> SyncResult<Uuid> {
        let graph = TransformGraph::build(&spec.graph, &self.nodes)?;
        let source = self.connectors.resolve_source(&spec.source)?;
        let destination = self.connectors.resolve_destination(&spec.destination)?;
        let state = self.state.entity_state(spec.sync_id)?;
        let cursor = self.state.cursor(spec.sync_id)?;

        let job = Job::new(spec.organization_id, spec.plan, spec.source, spec.destination);
        let job_id = job.id;
        let shared: SharedJob = Arc::new(RwLock::new(job));
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);

        let run = JobRun {
            job: shared.clone(),
            collection_id: spec.collection_id,
            source,
            destination,
            embedder: self.embedder.clone(),
            graph: Arc::new(graph),
            state,
            cursor,
            incremental: spec.incremental,
        };

        {
            let mut jobs = self.jobs.write().map_err(|_| poisoned_jobs())?;
            self.evict_finished(&mut jobs);
            jobs.insert(
                job_id,
                JobHandle {
                    job: shared,
                    cancel: cancel.clone(),
                    report: rx,
                },
            );
        }

        tracing::info!(job_id = %job_id, sync_id = %spec.sync_id, "Sync job accepted");

        let supervisor = self.supervisor.clone();
        supervisor.hub().open(job_id);
        tokio::spawn(async move {
            let report = supervisor.run(run, cancel).await;
            // Nobody waiting is fine
            let _ = tx.send(Some(report));
            supervisor.hub().remove(job_id);
        });

        Ok(job_id)
    }

    /// Raise the job's cancellation signal; `false` if unknown or already finished
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let Ok(jobs) = self.jobs.read() else {
            return false;
        };
        let Some(handle) = jobs.get(&job_id) else {
            return false;
        };
        let terminal = handle
            .job
            .read()
            .map(|job| job.status.is_terminal())
            .unwrap_or(true);
        if terminal {
            return false;
        }
        tracing::info!(job_id = %job_id, "Cancelling sync job");
        handle.cancel.cancel();
        true
    }

    /// Follow a job's progress; for a finished job only the final snapshot
    pub fn subscribe(&self, job_id: Uuid) -> ProgressSubscription {
        // The channel goes away only after the report is out
        self.supervisor
            .hub()
            .follow(job_id)
            .unwrap_or_else(|| ProgressSubscription::ended(self.final_snapshot(job_id)))
    }

    pub fn latest_progress(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.supervisor
            .hub()
            .latest(job_id)
            .or_else(|| self.final_snapshot(job_id))
    }

    fn final_snapshot(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.jobs.read().ok()?.get(&job_id)?.final_snapshot()
    }

    /// Drop a finished job; `false` if it is unknown or still running
    pub fn forget(&self, job_id: Uuid) -> bool {
        let Ok(mut jobs) = self.jobs.write() else {
            return false;
        };
        if !jobs.get(&job_id).is_some_and(JobHandle::is_finished) {
            return false;
        }
        jobs.remove(&job_id);
        true
    }

    /// Number of jobs the service still tracks
    pub fn job_count(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Forget the oldest finished jobs beyond the retention limit
    fn evict_finished(&self, jobs: &mut HashMap<Uuid, JobHandle>) {
        let retention = self.supervisor.config().finished_job_retention;
        let mut finished: Vec<(Option<DateTime<Utc>>, Uuid)> = jobs
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, handle)| (handle.finished_at(), *id))
            .collect();
        if finished.len() <= retention {
            return;
        }

        finished.sort();
        let excess = finished.len() - retention;
        for (_, job_id) in finished.into_iter().take(excess) {
            jobs.remove(&job_id);
        }
        tracing::debug!(evicted = excess, "Forgot finished sync jobs");
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        let jobs = self.jobs.read().ok()?;
        let handle = jobs.get(&job_id)?;
        let job = handle.job.read().ok()?.clone();
        Some(job)
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.job(job_id).map(|job| job.status)
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, job_id: Uuid) -> SyncResult<JobReport> {
        let mut rx = {
            let jobs = self.jobs.read().map_err(|_| poisoned_jobs())?;
            jobs.get(&job_id).ok_or_else(|| unknown_job(job_id))?.report.clone()
        };

        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SyncError::Internal(format!("job {job_id} ended without a report")))?;

        report.clone().ok_or_else(|| unknown_job(job_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::destination::InMemoryDestination;
    use crate::embedding::HashingEmbedder;
    use crate::graph::NodeSpec;
    use crate::liveness::StaticLiveness;
    use crate::progress::ProgressHub;
    use crate::rate_limit::RateLimiter;
    use crate::source::{Source, VecSource};
    use crate::state::InMemoryStateProvider;
    use serde_json::json;
    use syncflow_common::types::{Record, RecordKey};

    fn service(records: Vec<Record>) -> (SyncService, Arc<InMemoryDestination>) {
        service_with(
            SyncConfig {
                worker_count: 2,
                ..Default::default()
            },
            records,
        )
    }

    fn service_with(config: SyncConfig, records: Vec<Record>) -> (SyncService, Arc<InMemoryDestination>) {
        let config = Arc::new(config);
        let supervisor = Arc::new(JobSupervisor::new(
            config.clone(),
            Arc::new(RateLimiter::in_memory(config.rate_limit.clone())),
            Arc::new(ProgressHub::default()),
            Arc::new(StaticLiveness::default()),
        ));

        let memory = Arc::new(InMemoryDestination::new(16));
        let mut connectors = ConnectorRegistry::new();
        connectors.register_source("vec", move |_: &ConnectorRef| -> SyncResult<Arc<dyn Source>> {
            let source: Arc<dyn Source> = Arc::new(VecSource::new("vec", records.clone()));
            Ok(source)
        });
        connectors.register_memory_destination("memory", memory.clone());

        let service = SyncService::new(
            supervisor,
            connectors,
            NodeRegistry::with_builtins(),
            Arc::new(InMemoryStateProvider::new()),
            Arc::new(HashingEmbedder::new(16)),
        );
        (service, memory)
    }

    fn task(id: &str) -> Record {
        Record::new(RecordKey::new(id), "task", json!({"title": id}))
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let (service, memory) = service(vec![task("a"), task("b")]);
        let spec = JobSpec::new(Uuid::new_v4(), ConnectorRef::new("vec"), ConnectorRef::new("memory"));

        let job_id = service.start(spec).unwrap();
        let report = service.wait(job_id).await.unwrap();

        assert_eq!(report.status(), JobStatus::Succeeded);
        assert_eq!(report.snapshot.inserted, 2);
        assert_eq!(memory.len().await, 2);
        assert_eq!(service.status(job_id), Some(JobStatus::Succeeded));
        assert!(!service.cancel(job_id));
    }

    #[tokio::test]
    async fn test_rejects_invalid_jobs_before_start() {
        let (service, _) = service(Vec::new());
        let org = Uuid::new_v4();

        let cyclic = GraphConfig {
            nodes: vec![
                NodeSpec::new("passthrough", "a", &["b"]),
                NodeSpec::new("passthrough", "b", &["a"]),
            ],
        };
        let spec = JobSpec::new(org, ConnectorRef::new("vec"), ConnectorRef::new("memory")).with_graph(cyclic);
        assert!(matches!(service.start(spec), Err(SyncError::Configuration(_))));

        let spec = JobSpec::new(org, ConnectorRef::new("salesforce"), ConnectorRef::new("memory"));
        assert!(matches!(service.start(spec), Err(SyncError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (service, _) = service(Vec::new());
        let id = Uuid::new_v4();
        assert!(!service.cancel(id));
        assert!(service.status(id).is_none());
        assert!(service.wait(id).await.is_err());
    }

    #[tokio::test]
    async fn test_finished_job_releases_progress_channel() {
        let (service, _) = service(vec![task("a")]);
        let spec = JobSpec::new(Uuid::new_v4(), ConnectorRef::new("vec"), ConnectorRef::new("memory"));

        let job_id = service.start(spec).unwrap();
        let report = service.wait(job_id).await.unwrap();
        // The channel is removed right after the report is sent
        tokio::task::yield_now().await;
        while service.supervisor.hub().channel_count() > 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(service.latest_progress(job_id), Some(report.snapshot.clone()));
        let mut late = service.subscribe(job_id);
        assert_eq!(late.next().await, Some(report.snapshot));
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn test_forget_only_drops_finished_jobs() {
        let (service, _) = service(vec![task("a")]);
        let spec = JobSpec::new(Uuid::new_v4(), ConnectorRef::new("vec"), ConnectorRef::new("memory"));

        let job_id = service.start(spec).unwrap();
        service.wait(job_id).await.unwrap();

        assert!(service.forget(job_id));
        assert!(!service.forget(job_id));
        assert!(service.status(job_id).is_none());
        assert_eq!(service.job_count(), 0);
    }

    #[tokio::test]
    async fn test_oldest_finished_jobs_are_evicted() {
        let config = SyncConfig {
            worker_count: 2,
            finished_job_retention: 2,
            ..Default::default()
        };
        let (service, _) = service_with(config, vec![task("a")]);
        let org = Uuid::new_v4();

        let mut ids = Vec::new();
        for _ in 0..4 {
            let spec = JobSpec::new(org, ConnectorRef::new("vec"), ConnectorRef::new("memory"));
            let job_id = service.start(spec).unwrap();
            service.wait(job_id).await.unwrap();
            ids.push(job_id);
        }

        // Eviction runs on start, before the new job is added
        assert_eq!(service.job_count(), 3);
        assert!(service.status(ids[0]).is_none());
        assert_eq!(service.status(ids[1]), Some(JobStatus::Succeeded));
        assert_eq!(service.status(ids[3]), Some(JobStatus::Succeeded));
    }
}
