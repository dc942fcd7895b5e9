//! Engine configuration
//!
//! Everything tunable about a sync run lives here: worker pool size, stream
//! capacity, retry policy, rate-limit quotas and progress cadence. Values are
//! loaded from `SYNC_*` environment variables on top of the defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

// ============================================================================
// Defaults
// ============================================================================

/// Default number of concurrent workers.
pub const DEFAULT_WORKER_COUNT: usize = 20;

/// Stream capacity as a multiple of the worker count when not set explicitly.
pub const DEFAULT_CAPACITY_MULTIPLIER: usize = 20;

/// Default rate-limit window length in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Default maximum time a call waits for a rate-limit token.
pub const DEFAULT_RATE_LIMIT_MAX_WAIT_MS: u64 = 30_000;

/// Default quota per window for plans without an explicit entry.
pub const DEFAULT_PLAN_QUOTA: u32 = 100;

/// Default interval between liveness checks.
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 10;

/// Default number of finished jobs the service keeps for status queries.
pub const DEFAULT_FINISHED_JOB_RETENTION: usize = 1_000;

fn default_true() -> bool {
    true
}

/// Top-level sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of workers pulling from the stream (W)
    pub worker_count: usize,
    /// Stream capacity (N); `None` means `20 × worker_count`
    pub stream_capacity: Option<usize>,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub progress: ProgressConfig,
    pub liveness_interval_secs: u64,
    /// Finished jobs kept queryable before the oldest are forgotten
    pub finished_job_retention: usize,
    pub embedding: EmbeddingConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            stream_capacity: None,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            progress: ProgressConfig::default(),
            liveness_interval_secs: DEFAULT_LIVENESS_INTERVAL_SECS,
            finished_job_retention: DEFAULT_FINISHED_JOB_RETENTION,
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            worker_count: env_or("SYNC_WORKER_COUNT", defaults.worker_count),
            stream_capacity: std::env::var("SYNC_STREAM_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok()),
            retry: RetryPolicy::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            progress: ProgressConfig::from_env(),
            liveness_interval_secs: env_or(
                "SYNC_LIVENESS_INTERVAL_SECS",
                defaults.liveness_interval_secs,
            ),
            finished_job_retention: env_or(
                "SYNC_FINISHED_JOB_RETENTION",
                defaults.finished_job_retention,
            ),
            embedding: EmbeddingConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("SYNC_WORKER_COUNT must be greater than 0");
        }
        if self.stream_capacity == Some(0) {
            anyhow::bail!("SYNC_STREAM_CAPACITY must be greater than 0");
        }
        if self.stream_capacity() < self.worker_count {
            warn!(
                capacity = self.stream_capacity(),
                workers = self.worker_count,
                "Stream capacity is below the worker count; some workers will idle"
            );
        }
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.progress.validate()?;
        if self.liveness_interval_secs == 0 {
            anyhow::bail!("SYNC_LIVENESS_INTERVAL_SECS must be greater than 0");
        }
        Ok(())
    }

    /// Effective stream capacity
    pub fn stream_capacity(&self) -> usize {
        self.stream_capacity
            .unwrap_or(self.worker_count.saturating_mul(DEFAULT_CAPACITY_MULTIPLIER))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }
}

/// Bounded exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_or("SYNC_RETRY_MAX_ATTEMPTS", defaults.max_attempts),
            base_delay_ms: env_or("SYNC_RETRY_BASE_DELAY_MS", defaults.base_delay_ms),
            multiplier: env_or("SYNC_RETRY_MULTIPLIER", defaults.multiplier),
            max_delay_ms: env_or("SYNC_RETRY_MAX_DELAY_MS", defaults.max_delay_ms),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("SYNC_RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            anyhow::bail!("SYNC_RETRY_MULTIPLIER must be >= 1.0, got {}", self.multiplier);
        }
        if self.max_delay_ms < self.base_delay_ms {
            anyhow::bail!(
                "SYNC_RETRY_MAX_DELAY_MS ({}) cannot be below SYNC_RETRY_BASE_DELAY_MS ({})",
                self.max_delay_ms,
                self.base_delay_ms
            );
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// Sliding-window quota settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub window_secs: u64,
    /// How long a call may wait for admission before it is denied
    pub max_wait_ms: u64,
    /// Requests per window, keyed by plan name
    pub plan_quotas: HashMap<String, u32>,
    /// Quota for plans missing from `plan_quotas`
    pub default_quota: u32,
    /// Fixed quotas for non-source scopes such as `embedding`
    #[serde(default)]
    pub scope_quotas: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let plan_quotas = [
            ("developer", 60),
            ("pro", 300),
            ("team", 1_000),
            ("enterprise", 5_000),
        ]
        .into_iter()
        .map(|(plan, quota)| (plan.to_string(), quota))
        .collect();

        Self {
            enabled: true,
            window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            max_wait_ms: DEFAULT_RATE_LIMIT_MAX_WAIT_MS,
            plan_quotas,
            default_quota: DEFAULT_PLAN_QUOTA,
            scope_quotas: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Load from `SYNC_RATE_LIMIT_*`
    ///
    /// Plan quotas come as `SYNC_RATE_LIMIT_PLANS=pro=300,team=1000`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.enabled = env_or("SYNC_RATE_LIMIT_ENABLED", config.enabled);
        config.window_secs = env_or("SYNC_RATE_LIMIT_WINDOW_SECS", config.window_secs);
        config.max_wait_ms = env_or("SYNC_RATE_LIMIT_MAX_WAIT_MS", config.max_wait_ms);
        config.default_quota = env_or("SYNC_RATE_LIMIT_DEFAULT_QUOTA", config.default_quota);

        if let Ok(plans) = std::env::var("SYNC_RATE_LIMIT_PLANS") {
            parse_quota_list(&plans, &mut config.plan_quotas);
        }
        if let Ok(scopes) = std::env::var("SYNC_RATE_LIMIT_SCOPES") {
            parse_quota_list(&scopes, &mut config.scope_quotas);
        }

        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.window_secs == 0 {
            anyhow::bail!("SYNC_RATE_LIMIT_WINDOW_SECS must be greater than 0");
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Quota for an organization's plan
    pub fn quota_for_plan(&self, plan: &str) -> u32 {
        self.plan_quotas
            .get(&plan.to_lowercase())
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Quota for a non-source scope; `None` means unlimited
    pub fn quota_for_scope(&self, scope: &str) -> Option<u32> {
        self.scope_quotas.get(scope).copied()
    }
}

/// Progress publication cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    pub flush_interval_ms: u64,
    /// Publish early once this many outcomes are pending
    pub flush_every: u64,
    /// Per-job broadcast buffer
    pub channel_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
            flush_every: 50,
            channel_capacity: 256,
        }
    }
}

impl ProgressConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            flush_interval_ms: env_or("SYNC_PROGRESS_FLUSH_INTERVAL_MS", defaults.flush_interval_ms),
            flush_every: env_or("SYNC_PROGRESS_FLUSH_EVERY", defaults.flush_every),
            channel_capacity: env_or("SYNC_PROGRESS_CHANNEL_CAPACITY", defaults.channel_capacity),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.flush_interval_ms == 0 {
            anyhow::bail!("SYNC_PROGRESS_FLUSH_INTERVAL_MS must be greater than 0");
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("SYNC_PROGRESS_CHANNEL_CAPACITY must be greater than 0");
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Embedding model settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Explicit vector size for custom models
    pub dimensions: Option<usize>,
    /// Explicit model name, overrides the size-based choice
    pub model: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub batch_size: Option<usize>,
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        Self {
            dimensions: std::env::var("EMBEDDING_DIM").ok().and_then(|s| s.parse().ok()),
            model: std::env::var("EMBEDDING_MODEL").ok().filter(|s| !s.is_empty()),
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
            api_base: std::env::var("OPENAI_API_BASE").ok().filter(|s| !s.is_empty()),
            batch_size: std::env::var("EMBEDDING_BATCH_SIZE").ok().and_then(|s| s.parse().ok()),
        }
    }
}

/// Parse `name=quota,name=quota` into `target`, skipping malformed entries
fn parse_quota_list(raw: &str, target: &mut HashMap<String, u32>) {
    for entry in raw.split(',') {
        let Some((name, quota)) = entry.split_once('=') else {
            warn!(entry, "Ignoring malformed quota entry");
            continue;
        };
        match quota.trim().parse() {
            Ok(quota) => {
                target.insert(name.trim().to_lowercase(), quota);
            },
            Err(_) => warn!(entry, "Ignoring quota with non-numeric value"),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
