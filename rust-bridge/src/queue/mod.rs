//! Queue boundary.
//!
//! The bridge never implements delivery, persistence or retry scheduling
//! itself. It talks to a queue engine through two traits:
//! - [`JobQueue`]: submit a job to a named queue
//! - [`Broker`]: start a worker that feeds jobs of a named queue to a processor
//!
//! ## Backends
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │   ProducerChannel    │        │   ConsumerGateway    │
//! └──────────┬───────────┘        └──────────┬───────────┘
//!            │ JobQueue::add                 │ Broker::worker
//!            ▼                               ▼
//! ┌───────────────────────────────────────────────────────┐
//! │  memory: MemoryBroker / MemoryQueue (tests, embedded) │
//! │  amqp:   AmqpQueue / AmqpBroker (RabbitMQ via lapin)   │
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{QueueError, SharedError};

pub use consumer::AmqpBroker;
pub use memory::{MemoryBroker, MemoryQueue};
pub use publisher::AmqpQueue;
pub use types::{ConnectionOptions, Job, JobOptions, WorkerOptions, DEFAULT_QUEUE};

/// Callback a worker runs for every delivered job.
///
/// An `Err` tells the queue the attempt failed, so its retry policy applies.
pub type JobProcessor = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<(), SharedError>> + Send + Sync>;

/// A queue jobs can be submitted to.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Name of the queue.
    fn name(&self) -> &str;

    /// Submit a job and return the queue's view of it.
    ///
    /// If `opts.job_id` names a job that already exists, the existing job is
    /// returned and nothing new is enqueued.
    async fn add(&self, name: &str, data: Value, opts: JobOptions) -> Result<Job, QueueError>;
}

/// A queue engine that can run workers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Start consuming `queue_name`, handing each job to `processor` and
    /// reporting every attempt's outcome on `events`.
    ///
    /// The worker owns `events`; once it is closed every clone is dropped and
    /// the receiving side sees the end of the stream.
    async fn worker(
        &self,
        queue_name: &str,
        options: WorkerOptions,
        processor: JobProcessor,
        events: WorkerEvents,
    ) -> Result<Box<dyn Worker>, QueueError>;
}

/// Outcome of a single processing attempt, as judged by the queue.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Completed(Job),
    Failed(Job, SharedError),
}

/// Sink a worker reports attempt outcomes to.
pub type WorkerEvents = mpsc::UnboundedSender<WorkerEvent>;

/// A running worker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stop taking deliveries, wait for in-flight jobs, and release whatever
    /// the worker itself opened, including its event sender. Calling it twice
    /// is harmless.
    async fn close(&self) -> Result<(), QueueError>;
}
