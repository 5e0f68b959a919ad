//! In-memory queue engine for tests and embedding.
//!
//! Mirrors the semantics the bridge relies on from a durable queue:
//! - Job ids are unique per queue; re-adding an existing id is a no-op
//! - Lower `priority` runs first, FIFO within a priority
//! - `delay_ms` holds a job back before it becomes deliverable
//! - Failed attempts are retried while `attempts` allows, after `backoff_ms`
//!
//! Nothing is persisted, and every job record (completed and failed ones
//! included) is kept for inspection as long as the queue lives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Broker, Job, JobOptions, JobProcessor, JobQueue, Worker, WorkerEvent, WorkerEvents, WorkerOptions};
use crate::error::QueueError;

/// A set of named in-memory queues.
///
/// Cloning shares the same queues, so a producer and a gateway built from
/// clones of one broker see the same jobs.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, MemoryQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the queue called `name`, creating it on first use.
    pub fn queue(&self, name: &str) -> MemoryQueue {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue::new(name))
            .clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn worker(
        &self,
        queue_name: &str,
        options: WorkerOptions,
        processor: JobProcessor,
        events: WorkerEvents,
    ) -> Result<Box<dyn Worker>, QueueError> {
        let queue = self.queue(queue_name);
        queue.worker(options, processor, events).await
    }
}

/// A single in-memory queue.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    available: Notify,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    waiting: VecDeque<(u8, String)>,
    delayed: usize,
    active: usize,
    completed: Vec<String>,
    failed: Vec<String>,
    next_id: u64,
    closed: bool,
}

impl QueueState {
    fn enqueue(&mut self, job: &Job) {
        let priority = job.opts.priority.unwrap_or(0);
        let pos = self
            .waiting
            .iter()
            .position(|(p, _)| *p > priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(pos, (priority, job.id.clone()));
    }
}

impl MemoryQueue {
    /// Create a standalone queue. Prefer [`MemoryBroker::queue`] when a
    /// gateway needs to find it by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                available: Notify::new(),
            }),
        }
    }

    /// Look a job up by id.
    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.state().jobs.get(id).cloned()
    }

    /// Number of jobs ever accepted.
    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().jobs.is_empty()
    }

    /// Jobs ready for delivery.
    pub fn waiting_count(&self) -> usize {
        self.state().waiting.len()
    }

    /// Jobs held back by `delay_ms` or a retry backoff.
    pub fn delayed_count(&self) -> usize {
        self.state().delayed
    }

    /// Jobs currently being processed.
    pub fn active_count(&self) -> usize {
        self.state().active
    }

    /// Ids of completed jobs, in completion order.
    pub fn completed(&self) -> Vec<String> {
        self.state().completed.clone()
    }

    /// Ids of jobs that exhausted their attempts, in failure order.
    pub fn failed(&self) -> Vec<String> {
        self.state().failed.clone()
    }

    /// Refuse further submissions, as an unreachable queue would.
    pub fn close(&self) {
        self.state().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Start a worker on this queue.
    pub async fn worker(
        &self,
        options: WorkerOptions,
        processor: JobProcessor,
        events: WorkerEvents,
    ) -> Result<Box<dyn Worker>, QueueError> {
        let concurrency = worker_concurrency(options.concurrency);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        debug!(queue = %self.inner.name, concurrency = concurrency, "memory_worker_starting");

        let task = tokio::spawn(run_worker(
            self.clone(),
            concurrency,
            processor,
            events,
            shutdown_rx,
        ));

        Ok(Box::new(MemoryWorker {
            queue: self.inner.name.clone(),
            shutdown: shutdown_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }))
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_next(&self) -> Option<Job> {
        let mut state = self.state();
        while let Some((_, id)) = state.waiting.pop_front() {
            // Drained jobs leave no record behind.
            if let Some(job) = state.jobs.get(&id).cloned() {
                state.active += 1;
                return Some(job);
            }
        }
        None
    }

    fn promote(&self, id: &str) {
        {
            let mut state = self.state();
            state.delayed = state.delayed.saturating_sub(1);
            let Some(job) = state.jobs.get(id).cloned() else {
                return;
            };
            state.enqueue(&job);
        }
        self.inner.available.notify_one();
    }

    fn schedule(&self, id: String, delay_ms: u64) {
        self.state().delayed += 1;
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            queue.promote(&id);
        });
    }

    fn complete(&self, job: Job) -> Job {
        let mut state = self.state();
        state.active = state.active.saturating_sub(1);
        state.completed.push(job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        job
    }

    fn fail(&self, mut job: Job) -> Job {
        job.attempts_made += 1;
        let retry = job.can_retry();
        {
            let mut state = self.state();
            state.active = state.active.saturating_sub(1);
            state.jobs.insert(job.id.clone(), job.clone());
            if !retry {
                state.failed.push(job.id.clone());
            }
        }

        if retry {
            debug!(
                queue = %self.inner.name,
                job_id = %job.id,
                attempts_made = job.attempts_made,
                "memory_job_retry_scheduled"
            );
            match job.opts.backoff_ms {
                Some(backoff) if backoff > 0 => self.schedule(job.id.clone(), backoff),
                _ => {
                    self.state().enqueue(&job);
                    self.inner.available.notify_one();
                }
            }
        }
        job
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn add(&self, name: &str, data: Value, opts: JobOptions) -> Result<Job, QueueError> {
        let job = {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed(self.inner.name.clone()));
            }

            let id = match &opts.job_id {
                Some(id) => id.clone(),
                None => {
                    state.next_id += 1;
                    state.next_id.to_string()
                }
            };

            if let Some(existing) = state.jobs.get(&id) {
                debug!(queue = %self.inner.name, job_id = %id, "memory_job_duplicate");
                return Ok(existing.clone());
            }

            let job = Job::new(self.inner.name.clone(), id, name, data, opts);
            state.jobs.insert(job.id.clone(), job.clone());
            job
        };

        match job.opts.delay_ms {
            Some(delay) if delay > 0 => self.schedule(job.id.clone(), delay),
            _ => {
                self.state().enqueue(&job);
                self.inner.available.notify_one();
            }
        }

        debug!(queue = %self.inner.name, job_id = %job.id, job_name = %job.name, "memory_job_added");
        Ok(job)
    }
}

struct MemoryWorker {
    queue: String,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Worker for MemoryWorker {
    async fn close(&self) -> Result<(), QueueError> {
        self.shutdown.send_replace(true);

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(queue = %self.queue, error = %e, "memory_worker_join_failed");
            }
            debug!(queue = %self.queue, "memory_worker_closed");
        }
        Ok(())
    }
}

async fn run_worker(
    queue: MemoryQueue,
    concurrency: usize,
    processor: JobProcessor,
    events: WorkerEvents,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(concurrency));

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = loop {
            if let Some(job) = queue.take_next() {
                break Some(job);
            }
            tokio::select! {
                _ = shutdown.changed() => break None,
                _ = queue.inner.available.notified() => {}
            }
        };
        let Some(job) = job else {
            break;
        };

        debug!(queue = %queue.inner.name, job_id = %job.id, "memory_job_delivered");

        let processor = Arc::clone(&processor);
        let events = events.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            match processor(job.clone()).await {
                Ok(()) => {
                    let job = queue.complete(job);
                    let _ = events.send(WorkerEvent::Completed(job));
                }
                Err(err) => {
                    let job = queue.fail(job);
                    let _ = events.send(WorkerEvent::Failed(job, err));
                }
            }
            drop(events);
            drop(permit);
        });
    }

    // Every permit back means every in-flight job has reported.
    if permits.acquire_many(concurrency as u32).await.is_err() {
        warn!(queue = %queue.inner.name, "memory_worker_drain_failed");
    }
    drop(events);
}

/// Clamp requested concurrency to what one semaphore can hand out and take
/// back in a single `acquire_many`.
fn worker_concurrency(requested: usize) -> usize {
    requested.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize))
}
