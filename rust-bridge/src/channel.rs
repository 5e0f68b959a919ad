//! Producer side: events in, jobs out.
//!
//! `send` never fails from the caller's point of view. Every outcome is
//! reported through the channel's notifications:
//!
//! ```text
//! send(event)
//!   ├─ event:received(event)
//!   ├─ name    = JobNameProvider::get(event)
//!   ├─ options = JobOptionsProvider::get(event, name, caller options)
//!   ├─ JobQueue::add(name, event, options)
//!   ├─ ok:  event:delivered(event), job:created(job)
//!   └─ err: event:error(event, error)
//! ```
//!
//! Nothing is retried here; retries are job options for the queue engine.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result, SharedError};
use crate::event::{Event, EventRecord};
use crate::notify::{ChannelNotification, NotificationKind, Notifier, SubscriptionId};
use crate::queue::{Job, JobOptions, JobQueue};
use crate::strategy::{EventIdJobName, JobIdFromName, JobNameProvider, JobOptionsProvider};

/// Converts events into queue jobs.
pub struct ProducerChannel<E: Event = EventRecord> {
    queue: Arc<dyn JobQueue>,
    job_name_provider: Arc<dyn JobNameProvider<E>>,
    job_options_provider: Arc<dyn JobOptionsProvider<E>>,
    notifier: Notifier<ChannelNotification<E>>,
}

/// Builder for [`ProducerChannel`].
pub struct ProducerChannelBuilder<E: Event> {
    queue: Arc<dyn JobQueue>,
    job_name_provider: Option<Arc<dyn JobNameProvider<E>>>,
    job_options_provider: Option<Arc<dyn JobOptionsProvider<E>>>,
}

impl<E: Event> ProducerChannelBuilder<E> {
    /// Derive job names with `provider` instead of using the event id.
    pub fn job_name_provider(mut self, provider: impl JobNameProvider<E> + 'static) -> Self {
        self.job_name_provider = Some(Arc::new(provider));
        self
    }

    /// Derive job options with `provider` instead of setting the job id to the
    /// job name.
    pub fn job_options_provider(mut self, provider: impl JobOptionsProvider<E> + 'static) -> Self {
        self.job_options_provider = Some(Arc::new(provider));
        self
    }

    pub fn build(self) -> ProducerChannel<E> {
        ProducerChannel {
            queue: self.queue,
            job_name_provider: self
                .job_name_provider
                .unwrap_or_else(|| Arc::new(EventIdJobName)),
            job_options_provider: self
                .job_options_provider
                .unwrap_or_else(|| Arc::new(JobIdFromName)),
            notifier: Notifier::new(),
        }
    }
}

impl<E: Event> ProducerChannel<E> {
    /// Start building a channel that submits to `queue`.
    pub fn builder(queue: impl JobQueue + 'static) -> ProducerChannelBuilder<E> {
        Self::builder_shared(Arc::new(queue))
    }

    /// Like [`builder`](Self::builder), for a queue that is already shared.
    pub fn builder_shared(queue: Arc<dyn JobQueue>) -> ProducerChannelBuilder<E> {
        ProducerChannelBuilder {
            queue,
            job_name_provider: None,
            job_options_provider: None,
        }
    }

    /// A channel with default strategies.
    pub fn new(queue: impl JobQueue + 'static) -> Self {
        Self::builder(queue).build()
    }

    /// Name of the queue jobs are submitted to.
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Subscribe to one notification kind.
    pub fn on<F>(&self, kind: NotificationKind, listener: F) -> SubscriptionId
    where
        F: Fn(&ChannelNotification<E>) + Send + Sync + 'static,
    {
        self.notifier.on(kind, listener)
    }

    /// Subscribe to the next notification of one kind.
    pub fn once<F>(&self, kind: NotificationKind, listener: F) -> SubscriptionId
    where
        F: Fn(&ChannelNotification<E>) + Send + Sync + 'static,
    {
        self.notifier.once(kind, listener)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.notifier.off(id)
    }

    /// Submit `event` as a job with default base options.
    pub async fn send(&self, event: E) {
        self.send_with_options(event, None).await
    }

    /// Submit `event` as a job. `options` are the base the options provider
    /// builds on; with the default provider the job id always wins over them.
    pub async fn send_with_options(&self, event: E, options: Option<JobOptions>) {
        self.notifier.emit(&ChannelNotification::EventReceived(event.clone()));

        match self.submit(&event, options.unwrap_or_default()).await {
            Ok(job) => {
                debug!(
                    queue = %job.queue,
                    job_id = %job.id,
                    job_name = %job.name,
                    event_id = %event.id(),
                    "channel_event_delivered"
                );
                self.notifier.emit(&ChannelNotification::EventDelivered(event));
                self.notifier.emit(&ChannelNotification::JobCreated(job));
            }
            Err(err) => {
                warn!(
                    queue = %self.queue.name(),
                    event_id = %event.id(),
                    error = %err,
                    "channel_event_failed"
                );
                let err: SharedError = Arc::new(err);
                self.notifier.emit(&ChannelNotification::EventError(event, err));
            }
        }
    }

    async fn submit(&self, event: &E, base: JobOptions) -> Result<Job> {
        let job_name = self
            .job_name_provider
            .get(event)
            .await
            .map_err(Error::JobName)?;
        if job_name.is_empty() {
            return Err(Error::EmptyJobName);
        }

        let options = self
            .job_options_provider
            .get(event, &job_name, base)
            .await
            .map_err(Error::JobOptions)?;

        let data = serde_json::to_value(event)?;
        Ok(self.queue.add(&job_name, data, options).await?)
    }
}
