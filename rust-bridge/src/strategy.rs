//! Pluggable strategies.
//!
//! Each strategy can be supplied either as a type implementing the trait's
//! single method, or as an async closure of the same shape:
//!
//! ```ignore
//! // object form
//! struct Prefixed;
//!
//! #[async_trait]
//! impl JobNameProvider<EventRecord> for Prefixed {
//!     async fn get(&self, event: &EventRecord) -> Result<String, BoxError> {
//!         Ok(format!("orders.{}", event.id))
//!     }
//! }
//!
//! // function form
//! let provider = |event: &EventRecord| {
//!     let name = format!("orders.{}", event.id);
//!     async move { Ok(name) }
//! };
//! ```
//!
//! Builders turn both forms into the same `Arc<dyn Trait<E>>`. Implementations
//! may be invoked concurrently from several jobs; the bridge does not serialize
//! calls.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BoxError;
use crate::event::Event;
use crate::queue::{Job, JobOptions};

/// Derives a job name from an event.
#[async_trait]
pub trait JobNameProvider<E: Event>: Send + Sync {
    async fn get(&self, event: &E) -> Result<String, BoxError>;
}

/// Derives job options from an event, its job name, and caller-supplied
/// base options.
#[async_trait]
pub trait JobOptionsProvider<E: Event>: Send + Sync {
    async fn get(&self, event: &E, job_name: &str, base: JobOptions) -> Result<JobOptions, BoxError>;
}

/// Rebuilds an event from a delivered job.
#[async_trait]
pub trait EventExtractor<E: Event>: Send + Sync {
    async fn extract(&self, job: &Job) -> Result<E, BoxError>;
}

/// Application logic run for every consumed event.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E) -> Result<Value, BoxError>;
}

// =============================================================================
// Function form
// =============================================================================

#[async_trait]
impl<E, F, Fut> JobNameProvider<E> for F
where
    E: Event,
    F: Fn(&E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
{
    async fn get(&self, event: &E) -> Result<String, BoxError> {
        (self)(event).await
    }
}

#[async_trait]
impl<E, F, Fut> JobOptionsProvider<E> for F
where
    E: Event,
    F: Fn(&E, &str, JobOptions) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JobOptions, BoxError>> + Send + 'static,
{
    async fn get(&self, event: &E, job_name: &str, base: JobOptions) -> Result<JobOptions, BoxError> {
        (self)(event, job_name, base).await
    }
}

#[async_trait]
impl<E, F, Fut> EventExtractor<E> for F
where
    E: Event,
    F: Fn(&Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<E, BoxError>> + Send + 'static,
{
    async fn extract(&self, job: &Job) -> Result<E, BoxError> {
        (self)(job).await
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for F
where
    E: Event,
    F: Fn(&E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    async fn handle(&self, event: &E) -> Result<Value, BoxError> {
        (self)(event).await
    }
}

// =============================================================================
// Defaults
// =============================================================================

/// Job name = event id.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventIdJobName;

#[async_trait]
impl<E: Event> JobNameProvider<E> for EventIdJobName {
    async fn get(&self, event: &E) -> Result<String, BoxError> {
        Ok(event.id().to_string())
    }
}

/// Job id = job name, over whatever the caller passed.
///
/// Resubmitting the same event therefore targets the same job id, which the
/// queue deduplicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobIdFromName;

#[async_trait]
impl<E: Event> JobOptionsProvider<E> for JobIdFromName {
    async fn get(&self, _event: &E, job_name: &str, base: JobOptions) -> Result<JobOptions, BoxError> {
        Ok(base.merge(JobOptions::default().with_job_id(job_name)))
    }
}

/// The job payload is the event.
pub struct PayloadExtractor<E>(PhantomData<fn() -> E>);

impl<E> PayloadExtractor<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for PayloadExtractor<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Event> EventExtractor<E> for PayloadExtractor<E> {
    async fn extract(&self, job: &Job) -> Result<E, BoxError> {
        Ok(serde_json::from_value(job.data.clone())?)
    }
}
