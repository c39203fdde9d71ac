//! The reconcile work queue.
//!
//! Change events enqueue `(kind, namespace, name)` keys. The queue
//! deduplicates: a key already waiting is not enqueued twice, and a key
//! currently being reconciled is marked dirty and re-queued when its pass
//! finishes, so each run object is reconciled serially while different
//! objects proceed in parallel across workers.
//!
//! Failed passes with a retryable error re-enter the queue after
//! exponential backoff with jitter; deadline-driven requeues (timeouts)
//! are scheduled by the reconcilers through [`Controller::schedule_after`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::metrics as flow_metrics;

/// Kinds of run objects the engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A TaskRun.
    TaskRun,
    /// A PipelineRun.
    PipelineRun,
}

impl Kind {
    /// Returns the metrics/log label for the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRun => "TaskRun",
            Self::PipelineRun => "PipelineRun",
        }
    }
}

/// A work-queue key identifying one run object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Object kind.
    pub kind: Kind,
    /// Object namespace.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl Key {
    /// Creates a key.
    #[must_use]
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind.as_str(), self.namespace, self.name)
    }
}

/// Outcome of a successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing more to do until the next watch event.
    Done,
    /// Re-reconcile after the given delay (deadline handling).
    RequeueAfter(Duration),
}

/// A reconciler driven by the controller.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Runs one reconcile pass for the keyed object.
    async fn reconcile(&self, key: &Key) -> Result<Outcome>;
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Key>,
    queued: HashSet<Key>,
    in_flight: HashSet<Key>,
    dirty: HashSet<Key>,
    failures: HashMap<Key, u32>,
}

/// Deduplicating work queue with at-most-one-in-flight per key.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueues a key. A key already waiting is dropped; a key currently
    /// in flight is marked dirty and re-queued when its pass completes.
    pub fn enqueue(&self, key: Key) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Waits for the next key and marks it in flight.
    pub async fn next(&self) -> Key {
        loop {
            {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks a pass finished; a dirty key re-enters the queue immediately.
    pub fn done(&self, key: &Key) {
        let requeue = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.in_flight.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            flow_metrics::record_requeue(key.kind.as_str(), "dirty");
            self.enqueue(key.clone());
        }
    }

    /// Records a failed pass, returning the new consecutive-failure count.
    pub fn record_failure(&self, key: &Key) -> u32 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = state.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Clears the failure count after a successful pass.
    pub fn reset_failures(&self, key: &Key) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.failures.remove(key);
    }

    /// Returns the number of keys waiting (not in flight).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .queue
            .len()
    }

    /// Returns true when no keys are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exponential backoff with jitter: `base * 2^(attempt-1)`, capped, with
/// up to 20% random spread.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    const BASE_MS: u64 = 100;
    const CAP_MS: u64 = 30_000;
    let exp = attempt.saturating_sub(1).min(16);
    let raw = BASE_MS.saturating_mul(1_u64 << exp).min(CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=raw / 5);
    Duration::from_millis(raw + jitter)
}

/// Drives reconcilers from the work queue with a pool of worker tasks.
pub struct Controller {
    queue: Arc<WorkQueue>,
    reconcilers: HashMap<Kind, Arc<dyn Reconcile>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Controller {
    /// Creates a controller over the given queue.
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            reconcilers: HashMap::new(),
            shutdown_tx,
        }
    }

    /// Registers the reconciler for a kind.
    #[must_use]
    pub fn with_reconciler(mut self, kind: Kind, reconciler: Arc<dyn Reconcile>) -> Self {
        self.reconcilers.insert(kind, reconciler);
        self
    }

    /// Returns the underlying queue for event sources.
    #[must_use]
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Schedules a key to re-enter the queue after `delay` (deadline timer).
    pub fn schedule_after(queue: &Arc<WorkQueue>, key: Key, delay: Duration) {
        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Spawns `workers` tasks draining the queue until shutdown.
    #[must_use]
    pub fn run(&self, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|_| {
                let queue = Arc::clone(&self.queue);
                let reconcilers = self.reconcilers.clone();
                let mut shutdown = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    loop {
                        let key = tokio::select! {
                            key = queue.next() => key,
                            _ = shutdown.changed() => return,
                        };
                        Self::process(&queue, &reconcilers, key).await;
                    }
                })
            })
            .collect()
    }

    /// Signals workers to stop after their current pass.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn process(
        queue: &Arc<WorkQueue>,
        reconcilers: &HashMap<Kind, Arc<dyn Reconcile>>,
        key: Key,
    ) {
        let Some(reconciler) = reconcilers.get(&key.kind) else {
            tracing::error!(key = %key, "no reconciler registered for kind");
            queue.done(&key);
            return;
        };

        let started = Instant::now();
        match reconciler.reconcile(&key).await {
            Ok(Outcome::Done) => {
                queue.reset_failures(&key);
                flow_metrics::record_reconcile(key.kind.as_str(), "ok", started);
                queue.done(&key);
            }
            Ok(Outcome::RequeueAfter(delay)) => {
                queue.reset_failures(&key);
                flow_metrics::record_reconcile(key.kind.as_str(), "ok", started);
                flow_metrics::record_requeue(key.kind.as_str(), "deadline");
                queue.done(&key);
                Self::schedule_after(queue, key, delay);
            }
            Err(err) if err.is_retryable() => {
                let attempt = queue.record_failure(&key);
                tracing::warn!(key = %key, attempt, error = %err, "reconcile failed, backing off");
                flow_metrics::record_reconcile(key.kind.as_str(), "retry", started);
                flow_metrics::record_requeue(key.kind.as_str(), "backoff");
                queue.done(&key);
                Self::schedule_after(queue, key, backoff_delay(attempt));
            }
            Err(err) => {
                tracing::error!(key = %key, error = %err, "reconcile failed terminally");
                flow_metrics::record_reconcile(key.kind.as_str(), "error", started);
                queue.done(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    fn key(name: &str) -> Key {
        Key::new(Kind::TaskRun, "default", name)
    }

    #[test]
    fn enqueue_deduplicates_waiting_keys() {
        let queue = WorkQueue::new();
        queue.enqueue(key("a"));
        queue.enqueue(key("a"));
        queue.enqueue(key("b"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn in_flight_key_is_marked_dirty_and_requeued() {
        let queue = WorkQueue::new();
        queue.enqueue(key("a"));

        let popped = block_on(queue.next());
        assert_eq!(popped.name, "a");
        assert!(queue.is_empty());

        // Event arrives mid-pass: not enqueued yet, but not lost either.
        queue.enqueue(key("a"));
        assert!(queue.is_empty());

        queue.done(&popped);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn failure_counts_accumulate_and_reset() {
        let queue = WorkQueue::new();
        assert_eq!(queue.record_failure(&key("a")), 1);
        assert_eq!(queue.record_failure(&key("a")), 2);
        queue.reset_failures(&key("a"));
        assert_eq!(queue.record_failure(&key("a")), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(120));

        let capped = backoff_delay(30);
        assert!(capped >= Duration::from_millis(30_000));
        assert!(capped <= Duration::from_millis(36_000));
    }
}
