//! Bounded record stream between the source producer and the workers
//!
//! Backed by a `tokio::sync::mpsc` channel of capacity N. The producer blocks
//! in [`StreamProducer::push`] while N records are buffered; consumers share
//! the receiver and block in [`StreamConsumer::pop`] while it is empty. Both
//! sides return `Cancelled` as soon as the job's token fires.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use syncflow_common::types::Record;

use crate::error::{SyncError, SyncResult};

/// Buffer accounting shared by both ends
#[derive(Debug)]
pub struct StreamStats {
    capacity: usize,
    pushed: AtomicU64,
    popped: AtomicU64,
    high_water: AtomicUsize,
}

impl StreamStats {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records accepted by the stream
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Acquire)
    }

    /// Records handed to a consumer
    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Acquire)
    }

    /// Largest number of buffered records observed after a push
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }
}

/// Create a stream of `capacity` records bound to `cancel`
pub fn bounded(capacity: usize, cancel: CancellationToken) -> (StreamProducer, StreamConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(StreamStats::new(capacity));

    let producer = StreamProducer {
        tx,
        cancel: cancel.clone(),
        stats: stats.clone(),
    };
    let consumer = StreamConsumer {
        rx: Arc::new(Mutex::new(rx)),
        cancel,
        stats,
    };
    (producer, consumer)
}

/// Write end, owned by the source producer task
#[derive(Debug)]
pub struct StreamProducer {
    tx: mpsc::Sender<Record>,
    cancel: CancellationToken,
    stats: Arc<StreamStats>,
}

impl StreamProducer {
    /// Enqueue a record, waiting while the stream is full
    pub async fn push(&self, record: Record) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            sent = self.tx.send(record) => {
                sent.map_err(|_| SyncError::Internal("all stream consumers are gone".to_string()))?;
                self.stats.pushed.fetch_add(1, Ordering::AcqRel);
                self.stats.high_water.fetch_max(self.buffered(), Ordering::AcqRel);
                Ok(())
            }
        }
    }

    /// Records currently buffered
    pub fn buffered(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    /// Signal end of stream; consumers drain what is buffered, then see `None`
    pub fn close(self) {
        tracing::debug!(pushed = self.stats.pushed(), "Stream closed by producer");
    }
}

/// Read end, cloned into every worker
#[derive(Debug, Clone)]
pub struct StreamConsumer {
    rx: Arc<Mutex<mpsc::Receiver<Record>>>,
    cancel: CancellationToken,
    stats: Arc<StreamStats>,
}

impl StreamConsumer {
    /// Next record, `Ok(None)` once the stream is closed and drained
    pub async fn pop(&self) -> SyncResult<Option<Record>> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            next = async { self.rx.lock().await.recv().await } => next,
        };

        if next.is_some() {
            self.stats.popped.fetch_add(1, Ordering::AcqRel);
        }
        Ok(next)
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn record(i: usize) -> Record {
        Record::new(format!("r{i}"), "task", json!({ "n": i }))
    }

    #[tokio::test]
    async fn test_drains_after_close() {
        let (producer, consumer) = bounded(4, CancellationToken::new());
        for i in 0..3 {
            producer.push(record(i)).await.unwrap();
        }
        producer.close();

        let mut keys = Vec::new();
        while let Some(r) = consumer.pop().await.unwrap() {
            keys.push(r.key.to_string());
        }
        assert_eq!(keys, vec!["r0", "r1", "r2"]);
        assert_eq!(consumer.stats().popped(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_blocks_when_full() {
        let (producer, consumer) = bounded(2, CancellationToken::new());
        producer.push(record(0)).await.unwrap();
        producer.push(record(1)).await.unwrap();
        assert_eq!(producer.buffered(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), producer.push(record(2))).await;
        assert!(blocked.is_err(), "push must wait while the stream is full");

        consumer.pop().await.unwrap().unwrap();
        producer.push(record(2)).await.unwrap();
        assert_eq!(producer.stats().high_water(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_full_push() {
        let cancel = CancellationToken::new();
        let (producer, _consumer) = bounded(1, cancel.clone());
        producer.push(record(0)).await.unwrap();

        let push = tokio::spawn(async move { producer.push(record(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(push.await.unwrap(), Err(SyncError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_empty_pop() {
        let cancel = CancellationToken::new();
        let (_producer, consumer) = bounded(1, cancel.clone());

        let pop = tokio::spawn(async move { consumer.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(pop.await.unwrap(), Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_push_after_cancel_returns_immediately() {
        let cancel = CancellationToken::new();
        let (producer, _consumer) = bounded(1, cancel.clone());
        cancel.cancel();
        assert!(matches!(producer.push(record(0)).await, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_consumers_share_records() {
        let (producer, consumer) = bounded(8, CancellationToken::new());
        let a = consumer.clone();
        let b = consumer;

        for i in 0..6 {
            producer.push(record(i)).await.unwrap();
        }
        producer.close();

        let (ra, rb) = tokio::join!(
            async {
                let mut n = 0;
                while a.pop().await.unwrap().is_some() {
                    n += 1;
                }
                n
            },
            async {
                let mut n = 0;
                while b.pop().await.unwrap().is_some() {
                    n += 1;
                }
                n
            }
        );
        assert_eq!(ra + rb, 6);
    }
}
