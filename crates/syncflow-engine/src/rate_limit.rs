//! Sliding-window rate limiting for external API calls
//!
//! Quotas are enforced per (organization, scope) where the scope is usually
//! the source's short name. Every granted call leaves a timestamped token in
//! the window store; a call is admitted only while fewer than `quota` tokens
//! fall inside the trailing window.
//!
//! The admission check and the token insert happen atomically inside the
//! store. [`InMemoryWindowStore`] covers every job in one process;
//! `PgWindowStore` (feature `postgres`) extends the guarantee to job instances
//! running in other processes.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::error::{SyncError, SyncResult};

/// Shortest sleep between admission attempts
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Admissions between sweeps of idle windows in [`InMemoryWindowStore`]
const SWEEP_EVERY: u64 = 256;

/// Quota key: one window per organization and scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub organization_id: Uuid,
    pub scope: String,
}

impl RateKey {
    pub fn new(organization_id: Uuid, scope: impl Into<String>) -> Self {
        Self {
            organization_id,
            scope: scope.into(),
        }
    }

    /// Key under which the window is stored
    pub fn storage_key(&self) -> String {
        format!("ratelimit:{}:{}", self.organization_id, self.scope)
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.organization_id, self.scope)
    }
}

/// A key paired with its quota, resolved once per job
#[derive(Debug, Clone)]
pub struct RateScope {
    pub key: RateKey,
    /// `None` disables limiting for this scope
    pub quota: Option<u32>,
}

/// Result of one atomic check-and-insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Admitted,
    /// Window is full; the oldest token expires after this delay
    RetryAfter(Duration),
}

/// Result of [`RateLimiter::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied,
}

/// Storage for sliding windows
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically prune expired tokens, count the rest and record a new token
    /// if the count is below `quota`.
    async fn try_admit(&self, key: &str, quota: u32, window: Duration)
        -> SyncResult<AdmitDecision>;
}

/// Timestamped tokens of one window
#[derive(Debug, Default)]
pub struct WindowLog {
    tokens: VecDeque<Instant>,
}

impl WindowLog {
    /// Admit at `now` if fewer than `quota` tokens are younger than `window`
    pub fn try_admit(&mut self, now: Instant, quota: u32, window: Duration) -> AdmitDecision {
        self.prune(now, window);

        if quota == 0 {
            return AdmitDecision::RetryAfter(window);
        }

        if self.tokens.len() < quota as usize {
            self.tokens.push_back(now);
            return AdmitDecision::Admitted;
        }

        let retry_after = self
            .tokens
            .front()
            .map(|&oldest| (oldest + window).saturating_duration_since(now))
            .unwrap_or(window);
        AdmitDecision::RetryAfter(retry_after.max(MIN_BACKOFF))
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.tokens.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.tokens.pop_front();
            } else {
                break;
            }
        }
    }

    /// No token younger than `window` remains
    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        self.tokens
            .back()
            .is_none_or(|&newest| now.saturating_duration_since(newest) >= window)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Debug, Default)]
struct Windows {
    logs: HashMap<String, WindowLog>,
    admits: u64,
}

/// Process-wide window store
///
/// Windows with no live token are dropped, so keys of finished jobs do not
/// accumulate.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: Mutex<Windows>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens currently held for `key`, expired ones included until the next admit
    pub fn token_count(&self, key: &str) -> usize {
        self.windows
            .lock()
            .map(|windows| windows.logs.get(key).map(WindowLog::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of windows currently held
    pub fn window_count(&self) -> usize {
        self.windows.lock().map(|windows| windows.logs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn try_admit(
        &self,
        key: &str,
        quota: u32,
        window: Duration,
    ) -> SyncResult<AdmitDecision> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| SyncError::Internal("rate limit window lock poisoned".to_string()))?;
        let now = Instant::now();

        windows.admits += 1;
        if windows.admits % SWEEP_EVERY == 0 {
            windows.logs.retain(|_, log| !log.is_idle(now, window));
        }

        let log = windows.logs.entry(key.to_string()).or_default();
        let decision = log.try_admit(now, quota, window);
        if log.is_empty() {
            windows.logs.remove(key);
        }
        Ok(decision)
    }
}

/// Sliding-window limiter shared by every worker of every job in the process
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("store", &"<WindowStore>")
            .finish()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::new(Arc::new(InMemoryWindowStore::new()), config)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Resolve the scope for calls against the source API
    pub fn source_scope(&self, organization_id: Uuid, plan: &str, source: &str) -> RateScope {
        RateScope {
            key: RateKey::new(organization_id, source),
            quota: Some(self.config.quota_for_plan(plan)),
        }
    }

    /// Resolve the scope for a non-source collaborator (embedder, destination)
    pub fn auxiliary_scope(&self, organization_id: Uuid, scope: &str) -> RateScope {
        RateScope {
            key: RateKey::new(organization_id, scope),
            quota: self.config.quota_for_scope(scope),
        }
    }

    /// Wait up to `wait_budget` for a token
    ///
    /// Returns `Err(Cancelled)` if the job is cancelled while waiting.
    pub async fn acquire(
        &self,
        scope: &RateScope,
        wait_budget: Duration,
        cancel: &CancellationToken,
    ) -> SyncResult<Admission> {
        let Some(quota) = scope.quota.filter(|_| self.config.enabled) else {
            return Ok(Admission::Granted);
        };

        let storage_key = scope.key.storage_key();
        let window = self.config.window();
        let deadline = Instant::now() + wait_budget;

        loop {
            match self.store.try_admit(&storage_key, quota, window).await? {
                AdmitDecision::Admitted => return Ok(Admission::Granted),
                AdmitDecision::RetryAfter(delay) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!(key = %scope.key, quota, "Rate limit wait budget exhausted");
                        return Ok(Admission::Denied);
                    }
                    let sleep_for = delay.min(deadline - now).max(MIN_BACKOFF);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(sleep_for) => {},
                    }
                },
            }
        }
    }

    /// Acquire with the configured wait budget, turning a denial into an error
    pub async fn admit(&self, scope: &RateScope, cancel: &CancellationToken) -> SyncResult<()> {
        let budget = self.config.max_wait();
        match self.acquire(scope, budget, cancel).await? {
            Admission::Granted => Ok(()),
            Admission::Denied => Err(SyncError::RateLimitExceeded {
                key: scope.key.to_string(),
                waited_ms: budget.as_millis() as u64,
            }),
        }
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::PgWindowStore;

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use sqlx::PgPool;

    /// Window store shared by every process connected to the same database
    ///
    /// Each admission runs in one transaction holding a transaction-scoped
    /// advisory lock on the key, so concurrent prune/count/insert sequences
    /// for the same key are serialized.
    pub struct PgWindowStore {
        pool: Arc<PgPool>,
    }

    impl PgWindowStore {
        pub fn new(pool: Arc<PgPool>) -> Self {
            Self { pool }
        }

        /// Create the token table if it does not exist
        pub async fn ensure_schema(&self) -> SyncResult<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS rate_limit_tokens (
                    id BIGSERIAL PRIMARY KEY,
                    key TEXT NOT NULL,
                    granted_at TIMESTAMPTZ NOT NULL,
                    expires_at TIMESTAMPTZ NOT NULL
                )
                "#,
            )
            .execute(&*self.pool)
            .await
            .map_err(db_error)?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS rate_limit_tokens_key_granted ON rate_limit_tokens (key, granted_at)",
            )
            .execute(&*self.pool)
            .await
            .map_err(db_error)?;

            Ok(())
        }

        /// Drop tokens of every key whose TTL has passed
        pub async fn purge_expired(&self) -> SyncResult<u64> {
            let result = sqlx::query("DELETE FROM rate_limit_tokens WHERE expires_at <= clock_timestamp()")
                .execute(&*self.pool)
                .await
                .map_err(db_error)?;
            Ok(result.rows_affected())
        }
    }

    fn db_error(err: sqlx::Error) -> SyncError {
        SyncError::Transient(format!("rate limit store: {err}"))
    }

    #[async_trait]
    impl WindowStore for PgWindowStore {
        async fn try_admit(
            &self,
            key: &str,
            quota: u32,
            window: Duration,
        ) -> SyncResult<AdmitDecision> {
            let window_secs = window.as_secs_f64();
            let mut tx = self.pool.begin().await.map_err(db_error)?;

            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;

            sqlx::query(
                "DELETE FROM rate_limit_tokens WHERE key = $1 AND granted_at <= clock_timestamp() - make_interval(secs => $2)",
            )
            .bind(key)
            .bind(window_secs)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            let (count, retry_after_ms): (i64, Option<f64>) = sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       EXTRACT(EPOCH FROM (MIN(granted_at) + make_interval(secs => $2) - clock_timestamp()))::float8 * 1000
                FROM rate_limit_tokens
                WHERE key = $1
                "#,
            )
            .bind(key)
            .bind(window_secs)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;

            let decision = if quota > 0 && count < i64::from(quota) {
                sqlx::query(
                    r#"
                    INSERT INTO rate_limit_tokens (key, granted_at, expires_at)
                    VALUES ($1, clock_timestamp(), clock_timestamp() + make_interval(secs => $2))
                    "#,
                )
                .bind(key)
                .bind(window_secs)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
                AdmitDecision::Admitted
            } else {
                let delay = retry_after_ms
                    .filter(|ms| *ms > 0.0)
                    .map(|ms| Duration::from_millis(ms.ceil() as u64))
                    .unwrap_or(window);
                AdmitDecision::RetryAfter(delay.max(MIN_BACKOFF))
            };

            tx.commit().await.map_err(db_error)?;
            Ok(decision)
        }
    }
}
