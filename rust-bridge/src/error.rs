//! Error types shared by the channel, the gateway and the queue backends.

use std::sync::Arc;

use thiserror::Error;

/// Failure raised by a caller-supplied strategy or handler.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error as carried by notifications and worker events.
///
/// The same failure is handed to every listener and to the queue engine, so it
/// is reference counted rather than cloned.
pub type SharedError = Arc<Error>;

/// Construction-time misconfiguration. Never recovered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Neither a queue reference nor a queue name was supplied
    #[error("queue or queue name is required")]
    MissingQueue,

    /// The gateway was built without a handler
    #[error("handler is required")]
    MissingHandler,

    /// A connection URL could not be parsed
    #[error("invalid connection url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Failures reported by a queue backend.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Could not reach the broker
    #[error("connection failed: {0}")]
    Connection(String),

    /// The broker refused or lost a submission
    #[error("submit to queue '{queue}' failed: {reason}")]
    Submit {
        /// Target queue
        queue: String,
        /// Broker-side reason
        reason: String,
    },

    /// Could not start consuming a queue
    #[error("subscribe to queue '{queue}' failed: {reason}")]
    Subscribe {
        /// Target queue
        queue: String,
        /// Broker-side reason
        reason: String,
    },

    /// The queue has been closed and accepts no more work
    #[error("queue '{0}' is closed")]
    Closed(String),

    /// A job body could not be encoded or decoded
    #[error("job serialization failed: {0}")]
    Serialization(String),
}

/// Everything the channel and gateway can report.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad construction parameters
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The job name provider failed
    #[error("job name provider failed: {0}")]
    JobName(#[source] BoxError),

    /// The job name provider returned an empty name
    #[error("job name provider returned an empty name")]
    EmptyJobName,

    /// The job options provider failed
    #[error("job options provider failed: {0}")]
    JobOptions(#[source] BoxError),

    /// The event extractor failed
    #[error("event extraction failed: {0}")]
    Extraction(#[source] BoxError),

    /// The handler failed
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The event could not be turned into a job payload
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue engine failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// `start()` was called after `shutdown()`
    #[error("gateway has been shut down and cannot be restarted")]
    GatewayStopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
