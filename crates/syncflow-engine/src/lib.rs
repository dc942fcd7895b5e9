//! Syncflow Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Sync orchestration: records flow from a source through a bounded stream to
//! a pool of workers, which route them through a transform graph, embed them
//! and write them to a vector destination.
//!
//! # Components
//!
//! - **stream**: bounded single-producer, multi-consumer channel (backpressure)
//! - **worker**: fixed-size pool pulling from the stream
//! - **processor**: per-record enrich, route, vectorize, persist
//! - **graph**: transform graph resolved once per job, cycle-checked
//! - **convert**: file records to embeddable text
//! - **rate_limit**: sliding-window limiter keyed by organization and scope
//! - **progress**: outcome counters and snapshot publication
//! - **supervisor**: job lifecycle, cancellation and orphan detection
//! - **service**: start / cancel / subscribe / wait control surface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use syncflow_engine::prelude::*;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Arc::new(SyncConfig::default());
//! let supervisor = Arc::new(JobSupervisor::new(
//!     config.clone(),
//!     Arc::new(RateLimiter::in_memory(config.rate_limit.clone())),
//!     Arc::new(ProgressHub::default()),
//!     Arc::new(StaticLiveness::default()),
//! ));
//! let service = SyncService::new(
//!     supervisor,
//!     ConnectorRegistry::with_builtins(),
//!     NodeRegistry::with_builtins(),
//!     Arc::new(InMemoryStateProvider::new()),
//!     Arc::new(HashingEmbedder::new(384)),
//! );
//!
//! let spec = JobSpec::new(
//!     uuid::Uuid::new_v4(),
//!     ConnectorRef::new("jsonl").with_config(serde_json::json!({"path": "records.jsonl"})),
//!     ConnectorRef::new("memory"),
//! );
//! let job_id = service.start(spec)?;
//! let report = service.wait(job_id).await?;
//! println!("{}: {:?}", report.status(), report.snapshot);
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod config;
pub mod convert;
pub mod destination;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod liveness;
pub mod processor;
pub mod progress;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod service;
pub mod source;
pub mod state;
pub mod stream;
pub mod supervisor;
pub mod worker;

pub use error::{SyncError, SyncResult};

/// Commonly used types
pub mod prelude {
    pub use crate::config::SyncConfig;
    pub use crate::destination::{Destination, InMemoryDestination};
    pub use crate::embedding::{Embedder, HashingEmbedder, OpenAiEmbedder};
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::graph::{GraphConfig, NodeRegistry, NodeSpec, TransformGraph};
    pub use crate::liveness::{OwnerLiveness, StaticLiveness};
    pub use crate::progress::{Outcome, ProgressHub, ProgressSnapshot};
    pub use crate::rate_limit::RateLimiter;
    pub use crate::registry::ConnectorRegistry;
    pub use crate::service::{JobSpec, SyncService};
    pub use crate::source::{JsonlSource, Source, VecSource};
    pub use crate::state::InMemoryStateProvider;
    pub use crate::supervisor::{ConnectorRef, Job, JobReport, JobStatus, JobSupervisor};
}
