//! Fixed-size worker pool pulling from the record stream
//!
//! Each of the W workers loops: pop a record, hand it to the
//! [`RecordHandler`], repeat until the stream is closed and drained or the job
//! is cancelled. A record already handed to the handler always runs to
//! completion; cancellation only stops workers from pulling the next one.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use syncflow_common::types::Record;

use crate::stream::StreamConsumer;

/// Per-record work executed by a worker
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    async fn handle(&self, worker: usize, record: Record);
}

/// Counts records under active processing
#[derive(Debug, Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        InFlightGuard {
            gauge: Arc::clone(self),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Highest concurrency observed so far
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// Decrements the gauge on drop
#[derive(Debug)]
pub struct InFlightGuard {
    gauge: Arc<InFlightGauge>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Totals after every worker has exited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub workers: usize,
    pub handled: u64,
    pub peak_in_flight: usize,
    pub panicked: usize,
}

/// Pool of W workers bound to one job
#[derive(Debug, Clone)]
pub struct WorkerPool {
    size: usize,
    cancel: CancellationToken,
    gauge: Arc<InFlightGauge>,
}

impl WorkerPool {
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        Self {
            size: size.max(1),
            cancel,
            gauge: Arc::new(InFlightGauge::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn gauge(&self) -> Arc<InFlightGauge> {
        self.gauge.clone()
    }

    /// Run all workers to completion
    pub async fn run<H: RecordHandler>(&self, consumer: StreamConsumer, handler: Arc<H>) -> PoolSummary {
        let mut workers = JoinSet::new();

        for worker in 0..self.size {
            let consumer = consumer.clone();
            let handler = handler.clone();
            let cancel = self.cancel.clone();
            let gauge = self.gauge.clone();

            workers.spawn(async move {
                let mut handled = 0u64;
                loop {
                    if cancel.is_cancelled() {
                        tracing::debug!(worker, "Worker observed cancellation");
                        break;
                    }
                    let record = match consumer.pop().await {
                        Ok(Some(record)) => record,
                        Ok(None) => break,
                        Err(_) => {
                            tracing::debug!(worker, "Worker observed cancellation while idle");
                            break;
                        },
                    };

                    let _in_flight = gauge.enter();
                    handler.handle(worker, record).await;
                    handled += 1;
                }
                (worker, handled)
            });
        }
        drop(consumer);

        let mut summary = PoolSummary {
            workers: self.size,
            ..Default::default()
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((worker, handled)) => {
                    tracing::debug!(worker, handled, "Worker completed");
                    summary.handled += handled;
                },
                Err(e) => {
                    tracing::error!(error = %e, "Worker panicked");
                    summary.panicked += 1;
                },
            }
        }
        summary.peak_in_flight = self.gauge.peak();
        summary
    }
}
