//! Progress counters and snapshot publication
//!
//! Workers bump atomic counters through [`ProgressTracker::record`] and never
//! wait on subscribers. A publisher task turns the counters into immutable
//! [`ProgressSnapshot`]s, either every `flush_interval` or as soon as
//! `flush_every` outcomes are pending, and hands them to the
//! [`ProgressHub`], which fans them out per job id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ProgressConfig;

/// Terminal outcome of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Inserted,
    Updated,
    Kept,
    Skipped,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Inserted => "inserted",
            Outcome::Updated => "updated",
            Outcome::Kept => "kept",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
        }
    }
}

/// Published view of a job's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub sequence: u64,
    /// Records pulled from the source
    pub produced: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub kept: u64,
    pub failed: u64,
    pub deleted: u64,
    pub done: bool,
}

impl ProgressSnapshot {
    /// Sum over all terminal outcomes
    pub fn outcomes(&self) -> u64 {
        self.inserted + self.updated + self.kept + self.skipped + self.failed
    }
}

// ============================================================================
// Hub
// ============================================================================

struct JobChannel {
    tx: broadcast::Sender<ProgressSnapshot>,
    latest: Option<ProgressSnapshot>,
}

/// Process-wide progress pub/sub keyed by job id
pub struct ProgressHub {
    channels: Mutex<HashMap<Uuid, JobChannel>>,
    capacity: usize,
}

impl std::fmt::Debug for ProgressHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHub").field("capacity", &self.capacity).finish()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(ProgressConfig::default().channel_capacity)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn with_channel<T>(&self, job_id: Uuid, f: impl FnOnce(&mut JobChannel) -> T) -> Option<T> {
        let mut channels = self.channels.lock().ok()?;
        let channel = channels.entry(job_id).or_insert_with(|| JobChannel {
            tx: broadcast::channel(self.capacity).0,
            latest: None,
        });
        Some(f(channel))
    }

    /// Store and broadcast a snapshot; never blocks on subscribers
    pub fn publish(&self, snapshot: ProgressSnapshot) {
        let job_id = snapshot.job_id;
        self.with_channel(job_id, |channel| {
            // No receivers is fine
            let _ = channel.tx.send(snapshot.clone());
            channel.latest = Some(snapshot);
        });
    }

    /// Create a job's channel ahead of its first snapshot
    pub fn open(&self, job_id: Uuid) {
        self.with_channel(job_id, |_| ());
    }

    /// Follow a job's snapshots, starting with the latest one published
    pub fn subscribe(&self, job_id: Uuid) -> ProgressSubscription {
        self.with_channel(job_id, |channel| {
            ProgressSubscription::new(channel.latest.clone(), channel.tx.subscribe())
        })
        .unwrap_or_else(|| ProgressSubscription::ended(None))
    }

    /// Like [`subscribe`](Self::subscribe), but `None` once the channel is gone
    pub fn follow(&self, job_id: Uuid) -> Option<ProgressSubscription> {
        let channels = self.channels.lock().ok()?;
        let channel = channels.get(&job_id)?;
        Some(ProgressSubscription::new(channel.latest.clone(), channel.tx.subscribe()))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|channels| channels.len()).unwrap_or(0)
    }

    pub fn latest(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.channels
            .lock()
            .ok()?
            .get(&job_id)
            .and_then(|channel| channel.latest.clone())
    }

    /// Drop a job's channel; open subscriptions end
    pub fn remove(&self, job_id: Uuid) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&job_id);
        }
    }
}

/// Stream of snapshots for one job
#[derive(Debug)]
pub struct ProgressSubscription {
    latest: Option<ProgressSnapshot>,
    rx: broadcast::Receiver<ProgressSnapshot>,
    finished: bool,
    last_sequence: u64,
}

impl ProgressSubscription {
    fn new(latest: Option<ProgressSnapshot>, rx: broadcast::Receiver<ProgressSnapshot>) -> Self {
        Self {
            latest,
            rx,
            finished: false,
            last_sequence: 0,
        }
    }

    /// Subscription yielding at most `last` and then ending
    pub fn ended(last: Option<ProgressSnapshot>) -> Self {
        // The sender drops here, so the receiver reports closed
        Self::new(last, broadcast::channel(1).1)
    }

    /// Next snapshot newer than the last one returned
    ///
    /// `None` after the `done` snapshot or when the channel goes away. Slow
    /// subscribers skip snapshots they lagged behind on.
    pub async fn next(&mut self) -> Option<ProgressSnapshot> {
        if self.finished {
            return None;
        }
        if let Some(latest) = self.latest.take() {
            return Some(self.accept(latest));
        }

        loop {
            match self.rx.recv().await {
                Ok(snapshot) if snapshot.sequence <= self.last_sequence => continue,
                Ok(snapshot) => return Some(self.accept(snapshot)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress subscriber lagged");
                },
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                },
            }
        }
    }

    fn accept(&mut self, snapshot: ProgressSnapshot) -> ProgressSnapshot {
        self.last_sequence = snapshot.sequence;
        self.finished = snapshot.done;
        snapshot
    }
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    produced: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    skipped: AtomicU64,
    kept: AtomicU64,
    failed: AtomicU64,
    deleted: AtomicU64,
}

#[derive(Debug, Default)]
struct PublishState {
    sequence: u64,
    closed: bool,
}

/// Counters for one job plus its publication schedule
pub struct ProgressTracker {
    job_id: Uuid,
    counters: Counters,
    pending: AtomicU64,
    flush_every: u64,
    flush_interval: Duration,
    wake: Notify,
    state: Mutex<PublishState>,
    hub: Arc<ProgressHub>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("job_id", &self.job_id)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(job_id: Uuid, config: &ProgressConfig, hub: Arc<ProgressHub>) -> Self {
        Self {
            job_id,
            counters: Counters::default(),
            pending: AtomicU64::new(0),
            flush_every: config.flush_every,
            flush_interval: config.flush_interval(),
            wake: Notify::new(),
            state: Mutex::new(PublishState::default()),
            hub,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Count a record pulled from the source
    pub fn record_produced(&self) {
        self.counters.produced.fetch_add(1, Ordering::AcqRel);
    }

    /// Count a terminal outcome
    pub fn record(&self, outcome: Outcome) {
        self.record_many(outcome, 1);
    }

    pub fn record_many(&self, outcome: Outcome, count: u64) {
        if count == 0 {
            return;
        }
        let counter = match outcome {
            Outcome::Inserted => &self.counters.inserted,
            Outcome::Updated => &self.counters.updated,
            Outcome::Kept => &self.counters.kept,
            Outcome::Skipped => &self.counters.skipped,
            Outcome::Failed => &self.counters.failed,
        };
        counter.fetch_add(count, Ordering::AcqRel);

        let pending = self.pending.fetch_add(count, Ordering::AcqRel) + count;
        if self.flush_every > 0 && pending >= self.flush_every {
            self.wake.notify_one();
        }
    }

    pub fn record_deleted(&self, count: u64) {
        self.counters.deleted.fetch_add(count, Ordering::AcqRel);
        self.pending.fetch_add(count, Ordering::AcqRel);
    }

    /// Current counters; `sequence` is the last published one
    pub fn snapshot(&self) -> ProgressSnapshot {
        let sequence = self.state.lock().map(|s| s.sequence).unwrap_or(0);
        self.build_snapshot(sequence, false)
    }

    fn build_snapshot(&self, sequence: u64, done: bool) -> ProgressSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        ProgressSnapshot {
            job_id: self.job_id,
            sequence,
            produced: load(&self.counters.produced),
            inserted: load(&self.counters.inserted),
            updated: load(&self.counters.updated),
            skipped: load(&self.counters.skipped),
            kept: load(&self.counters.kept),
            failed: load(&self.counters.failed),
            deleted: load(&self.counters.deleted),
            done,
        }
    }

    /// Publish the current counters; `None` once finished or suppressed
    pub fn publish(&self, done: bool) -> Option<ProgressSnapshot> {
        let mut state = self.state.lock().ok()?;
        if state.closed {
            return None;
        }
        state.sequence += 1;
        state.closed = done;
        self.pending.store(0, Ordering::Release);

        let snapshot = self.build_snapshot(state.sequence, done);
        self.hub.publish(snapshot.clone());
        Some(snapshot)
    }

    /// Publish the final snapshot and stop the publisher
    pub fn finish(&self) -> Option<ProgressSnapshot> {
        let snapshot = self.publish(true);
        self.wake.notify_one();
        snapshot
    }

    /// Stop all publication without a final snapshot
    pub fn suppress(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Start the background publisher; it exits once the tracker is closed
    pub fn spawn_publisher(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tracker.wake.notified() => {},
                    _ = tokio::time::sleep(tracker.flush_interval) => {},
                }
                if tracker.is_closed() {
                    break;
                }
                if tracker.pending.load(Ordering::Acquire) > 0 {
                    tracker.publish(false);
                }
            }
            tracing::trace!(job_id = %tracker.job_id, "Progress publisher stopped");
        })
    }
}
