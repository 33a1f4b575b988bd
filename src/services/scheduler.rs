//! Task scheduling with resource-key deduplication, and the worker pool
//! that drains it.
//!
//! The scheduler is a bounded channel with a dedup front end: a task whose
//! resource key is already queued or running is coalesced into a single
//! re-run after the current execution finishes. That collapses repeated
//! refreshes of one entity into one execution and keeps the report
//! aggregator a single writer per report key.

use crate::error::TaskError;
use crate::services::aggregator::ReportAggregator;
use crate::services::refresh::RefreshService;
use crate::types::{Task, TaskAction};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct InFlight {
    /// Latest coalesced task to re-run once the current execution ends.
    rescheduled: Option<Task>,
}

/// Dedup-by-resource-key front end over a bounded task channel.
pub struct Scheduler {
    tx: mpsc::Sender<Task>,
    in_flight: DashMap<String, InFlight>,
    depth: AtomicUsize,
    high_water: usize,
    low_water: usize,
}

impl Scheduler {
    /// Create the scheduler and the receiving end the worker pool drains.
    pub fn new(
        capacity: usize,
        high_water: usize,
        low_water: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Task>) {
        let (tx, rx) = mpsc::channel(capacity);
        let scheduler = Arc::new(Self {
            tx,
            in_flight: DashMap::new(),
            depth: AtomicUsize::new(0),
            high_water,
            low_water,
        });
        (scheduler, rx)
    }

    /// Enqueue a task, coalescing against any queued or running task with
    /// the same resource key.
    pub async fn schedule(&self, task: Task) {
        let key = task.resource_key.clone();
        let coalesced = {
            use dashmap::mapref::entry::Entry;
            match self.in_flight.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().rescheduled = Some(task.clone());
                    true
                }
                Entry::Vacant(entry) => {
                    entry.insert(InFlight::default());
                    false
                }
            }
        };

        if coalesced {
            debug!("coalesced {} task for {}", task.action, key);
            return;
        }

        self.depth.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(task).await {
            // Channel closed during shutdown; drop the reservation.
            self.depth.fetch_sub(1, Ordering::SeqCst);
            self.in_flight.remove(&key);
            warn!("task channel closed, dropping task for {}: {}", key, e);
        }
    }

    /// Called by a worker when it starts executing a task.
    fn note_started(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    /// Called by a worker when a task finishes. Releases the resource key,
    /// or re-enqueues the latest coalesced task for it.
    async fn complete(&self, resource_key: &str) {
        if self
            .in_flight
            .remove_if(resource_key, |_, state| state.rescheduled.is_none())
            .is_some()
        {
            return;
        }

        let rerun = self
            .in_flight
            .get_mut(resource_key)
            .and_then(|mut entry| entry.rescheduled.take());
        if let Some(task) = rerun {
            debug!("re-running coalesced task for {}", resource_key);
            self.depth.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.tx.send(task).await {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                self.in_flight.remove(resource_key);
                warn!("task channel closed on re-run for {}: {}", resource_key, e);
            }
        }
    }

    /// Tasks queued but not yet started.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Resource keys currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Backpressure for producers: block while the queue sits above the
    /// high-water mark, resume once it drains below the low-water mark.
    pub async fn throttle(&self) {
        if self.depth() < self.high_water {
            return;
        }
        info!(
            "task queue above high-water mark ({}), pausing ingestion",
            self.high_water
        );
        while self.depth() > self.low_water {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        debug!("task queue drained below low-water mark, resuming ingestion");
    }
}

/// Retry policy for retryable task failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub limit: u32,
    pub base: Duration,
}

impl RetryPolicy {
    /// Exponential backoff with jitter, capped at 30 seconds.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as u64 * (1u64 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis(((exp as f64) * jitter) as u64).min(Duration::from_secs(30))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            base: Duration::from_millis(250),
        }
    }
}

/// Pool of workers executing tasks from the scheduler's channel.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `parallelism` workers. They run until the channel closes.
    pub fn start(
        parallelism: usize,
        rx: mpsc::Receiver<Task>,
        scheduler: Arc<Scheduler>,
        refresher: Arc<RefreshService>,
        aggregator: Arc<ReportAggregator>,
        retry: RetryPolicy,
    ) {
        info!("starting worker pool with {} workers", parallelism);
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..parallelism {
            let rx = rx.clone();
            let scheduler = scheduler.clone();
            let refresher = refresher.clone();
            let aggregator = aggregator.clone();
            tokio::spawn(async move {
                Self::run_worker(worker_id, rx, scheduler, refresher, aggregator, retry).await;
            });
        }
    }

    async fn run_worker(
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<Task>>>,
        scheduler: Arc<Scheduler>,
        refresher: Arc<RefreshService>,
        aggregator: Arc<ReportAggregator>,
        retry: RetryPolicy,
    ) {
        loop {
            let task = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(task) = task else {
                debug!("worker {} shutting down, channel closed", worker_id);
                break;
            };
            scheduler.note_started();

            Self::execute(&task, &scheduler, &refresher, &aggregator, retry).await;
            scheduler.complete(&task.resource_key).await;
        }
    }

    async fn execute(
        task: &Task,
        scheduler: &Arc<Scheduler>,
        refresher: &Arc<RefreshService>,
        aggregator: &Arc<ReportAggregator>,
        retry: RetryPolicy,
    ) {
        let mut attempt = 0;
        loop {
            let result: Result<(), TaskError> = match task.action {
                TaskAction::RefreshEntity => refresher.handle(task, scheduler).await,
                _ => aggregator.handle(task, scheduler).await,
            };

            match result {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempt < retry.limit => {
                    attempt += 1;
                    let delay = retry.delay(attempt);
                    warn!(
                        "task {} for {} failed (attempt {}): {}, retrying in {:?}",
                        task.action, task.resource_key, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "task {} for {} failed permanently: {}",
                        task.action, task.resource_key, e
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schedule_and_drain() {
        let (scheduler, mut rx) = Scheduler::new(16, 8, 2);
        scheduler.schedule(Task::refresh_entity(1)).await;
        scheduler.schedule(Task::refresh_entity(2)).await;
        assert_eq!(scheduler.depth(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.resource_key, "ENTITY|1");
        scheduler.note_started();
        assert_eq!(scheduler.depth(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_resource_keys_coalesce() {
        let (scheduler, mut rx) = Scheduler::new(16, 8, 2);
        scheduler.schedule(Task::refresh_entity(1)).await;
        scheduler.schedule(Task::refresh_entity(1)).await;
        scheduler.schedule(Task::refresh_entity(1)).await;

        // Only one queued execution.
        assert_eq!(scheduler.depth(), 1);
        let task = rx.recv().await.unwrap();
        scheduler.note_started();

        // Completion re-runs the coalesced duplicate exactly once.
        scheduler.complete(&task.resource_key).await;
        assert_eq!(scheduler.depth(), 1);
        let rerun = rx.recv().await.unwrap();
        assert_eq!(rerun.resource_key, "ENTITY|1");
        scheduler.note_started();
        scheduler.complete(&rerun.resource_key).await;

        assert_eq!(scheduler.depth(), 0);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_complete_without_duplicates_releases_key() {
        let (scheduler, mut rx) = Scheduler::new(16, 8, 2);
        scheduler.schedule(Task::refresh_entity(7)).await;
        let task = rx.recv().await.unwrap();
        scheduler.note_started();
        scheduler.complete(&task.resource_key).await;

        assert_eq!(scheduler.in_flight(), 0);

        // The key is schedulable again.
        scheduler.schedule(Task::refresh_entity(7)).await;
        assert_eq!(scheduler.depth(), 1);
    }

    #[tokio::test]
    async fn test_throttle_passes_below_high_water() {
        let (scheduler, _rx) = Scheduler::new(16, 8, 2);
        scheduler.schedule(Task::refresh_entity(1)).await;
        // Depth 1 < high water 8: must not block.
        scheduler.throttle().await;
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let retry = RetryPolicy {
            limit: 5,
            base: Duration::from_millis(100),
        };
        let first = retry.delay(1);
        assert!(first >= Duration::from_millis(100));
        assert!(retry.delay(20) <= Duration::from_secs(30));
    }
}
