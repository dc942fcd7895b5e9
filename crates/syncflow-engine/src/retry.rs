//! Retry wrapper for calls to external collaborators
//!
//! Transient failures and rate-limit denials are retried with bounded
//! exponential backoff. An expired credential gets exactly one refresh and
//! one more try; anything else is returned to the caller immediately.

use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};

/// Refreshes the credential a source or destination uses
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> SyncResult<()>;
}

/// Runs fallible async calls under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Retrier {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out
    ///
    /// Backoff sleeps end early with `Cancelled` when the job is cancelled.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        refresher: Option<&dyn CredentialRefresher>,
        mut op: F,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        let mut refreshed = false;

        loop {
            debug!(call = label, attempt, max_attempts, "Calling");
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err {
                SyncError::AuthRefreshable(reason) => {
                    let Some(refresher) = refresher.filter(|_| !refreshed) else {
                        return Err(SyncError::AuthFatal(reason));
                    };
                    refreshed = true;
                    warn!(call = label, "Credential rejected, refreshing");
                    if let Err(refresh_err) = refresher.refresh().await {
                        return Err(SyncError::AuthFatal(format!(
                            "{reason}; refresh failed: {refresh_err}"
                        )));
                    }
                },
                err if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        call = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Call failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {},
                    }
                    attempt += 1;
                },
                err => return Err(err),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
        }
    }

    struct CountingRefresher {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self) -> SyncResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SyncError::Transient("token endpoint down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let retrier = Retrier::new(policy(), CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));

        let result = retrier
            .run("fetch", None, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::Transient("503".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let retrier = Retrier::new(policy(), CancellationToken::new());
        let calls = AtomicU32::new(0);

        let result: SyncResult<()> = retrier
            .run("fetch", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::Transient("timeout".into())) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_is_not_retried() {
        let retrier = Retrier::new(policy(), CancellationToken::new());
        let calls = AtomicU32::new(0);

        let result: SyncResult<()> = retrier
            .run("fetch", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::Validation("missing id".into())) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_once_then_fatal() {
        let retrier = Retrier::new(policy(), CancellationToken::new());
        let refresher = CountingRefresher {
            calls: AtomicU32::new(0),
            fail: false,
        };

        let result: SyncResult<()> = retrier
            .run("fetch", Some(&refresher), || async {
                Err(SyncError::AuthRefreshable("401".into()))
            })
            .await;

        assert!(matches!(result, Err(SyncError::AuthFatal(_))));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_recovers() {
        let retrier = Retrier::new(policy(), CancellationToken::new());
        let refresher = CountingRefresher {
            calls: AtomicU32::new(0),
            fail: false,
        };
        let calls = AtomicU32::new(0);

        let result = retrier
            .run("fetch", Some(&refresher), || {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(SyncError::AuthRefreshable("401".into()))
                    } else {
                        Ok("page")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "page");
    }

    #[tokio::test]
    async fn test_failed_refresh_is_fatal() {
        let retrier = Retrier::new(policy(), CancellationToken::new());
        let refresher = CountingRefresher {
            calls: AtomicU32::new(0),
            fail: true,
        };

        let result: SyncResult<()> = retrier
            .run("fetch", Some(&refresher), || async {
                Err(SyncError::AuthRefreshable("401".into()))
            })
            .await;

        assert!(matches!(result, Err(SyncError::AuthFatal(_))));
    }

    #[tokio::test]
    async fn test_auth_without_refresher_is_fatal() {
        let retrier = Retrier::new(policy(), CancellationToken::new());
        let result: SyncResult<()> = retrier
            .run("fetch", None, || async {
                Err(SyncError::AuthRefreshable("401".into()))
            })
            .await;
        assert!(matches!(result, Err(SyncError::AuthFatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let retrier = Retrier::new(
            RetryPolicy {
                base_delay_ms: 60_000,
                max_delay_ms: 60_000,
                ..policy()
            },
            cancel.clone(),
        );

        let handle = tokio::spawn(async move {
            retrier
                .run("fetch", None, || async {
                    Err::<(), _>(SyncError::Transient("503".into()))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Err(SyncError::Cancelled)));
    }
}
