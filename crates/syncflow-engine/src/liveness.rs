//! Owner liveness checks for orphan detection
//!
//! A job is orphaned when the configuration or credential that owns it is
//! deleted while it runs. The supervisor polls an [`OwnerLiveness`] on a fixed
//! interval and tears the job down on the first negative answer.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SyncResult;
use crate::supervisor::Job;

#[async_trait]
pub trait OwnerLiveness: Send + Sync {
    /// `Ok(false)` once the job's owning resources are gone
    async fn is_alive(&self, job: &Job) -> SyncResult<bool>;
}

/// Liveness flag flipped by hand
#[derive(Debug)]
pub struct StaticLiveness {
    alive: AtomicBool,
}

impl Default for StaticLiveness {
    fn default() -> Self {
        Self::new(true)
    }
}

impl StaticLiveness {
    pub fn new(alive: bool) -> Self {
        Self {
            alive: AtomicBool::new(alive),
        }
    }

    /// Mark the owner as deleted
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn revive(&self) {
        self.alive.store(true, Ordering::Release);
    }
}

#[async_trait]
impl OwnerLiveness for StaticLiveness {
    async fn is_alive(&self, _job: &Job) -> SyncResult<bool> {
        Ok(self.alive.load(Ordering::Acquire))
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::PgLiveness;

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use crate::error::SyncError;
    use sqlx::PgPool;
    use std::sync::Arc;

    /// Checks that the job's source connection row still exists
    pub struct PgLiveness {
        pool: Arc<PgPool>,
    }

    impl PgLiveness {
        pub fn new(pool: Arc<PgPool>) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl OwnerLiveness for PgLiveness {
        async fn is_alive(&self, job: &Job) -> SyncResult<bool> {
            let (exists,): (bool,) = sqlx::query_as(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM source_connections
                    WHERE id = $1 AND organization_id = $2
                )
                "#,
            )
            .bind(job.source.id)
            .bind(job.organization_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| SyncError::Transient(format!("liveness check failed: {e}")))?;

            Ok(exists)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::supervisor::{ConnectorRef, Job};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_static_liveness_toggles() {
        let job = Job::new(
            Uuid::new_v4(),
            "pro",
            ConnectorRef::new("memory"),
            ConnectorRef::new("memory"),
        );
        let liveness = StaticLiveness::default();
        assert!(liveness.is_alive(&job).await.unwrap());

        liveness.kill();
        assert!(!liveness.is_alive(&job).await.unwrap());

        liveness.revive();
        assert!(liveness.is_alive(&job).await.unwrap());
    }
}
