//! EventQ - Bridge between typed events and a durable job queue.
//!
//! This library provides the two halves of the bridge plus the queue engines
//! they run on:
//! - `ProducerChannel`: turns an event into a job and submits it
//! - `ConsumerGateway`: runs a worker on a queue, turns each job back into an
//!   event and hands it to a handler
//!
//! ## Architecture
//!
//! ```text
//! send(event) → ProducerChannel → queue (RabbitMQ / in-memory) → ConsumerGateway → handler(event)
//! ```
//!
//! Both halves report progress and failures only through typed notifications
//! (`event:received`, `job:created`, `job:error`, ...), so retries,
//! dead-lettering and metrics can be layered on without touching the bridge.

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod notify;
pub mod queue;
pub mod signal;
pub mod strategy;

// Re-export commonly used types
pub use channel::{ProducerChannel, ProducerChannelBuilder};
pub use config::Config;
pub use error::{BoxError, ConfigError, Error, QueueError, SharedError};
pub use event::{Event, EventRecord};
pub use gateway::{ConsumerGateway, ConsumerGatewayBuilder, GatewayState};
pub use notify::{ChannelNotification, GatewayNotification, NotificationKind, SubscriptionId};
pub use queue::{
    AmqpBroker, AmqpQueue, Broker, ConnectionOptions, Job, JobOptions, JobQueue, MemoryBroker,
    MemoryQueue, WorkerOptions,
};
pub use strategy::{EventExtractor, EventHandler, JobNameProvider, JobOptionsProvider};
