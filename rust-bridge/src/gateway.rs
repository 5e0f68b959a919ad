//! Consumer side: jobs in, events out.
//!
//! A gateway binds one worker to a named queue. For every delivered job:
//!
//! ```text
//! job:received(job)
//!   → event = EventExtractor::extract(job)     (failure: error(job, err), job fails)
//!   → event:received(event)
//!   → EventHandler::handle(event)
//!       ok:  event:processed(event, result)
//!       err: event:error(event, err), job fails
//! ```
//!
//! A failed job is handed back to the queue engine, whose retry policy decides
//! what happens next. Its verdict on each attempt is relayed separately as
//! `job:completed(job)` / `job:error(job, err)`.
//!
//! ## Lifecycle
//!
//! `Idle → Running` on `start()`, `Running → Stopped` on `shutdown()`. A stopped
//! gateway cannot be restarted. The gateway installs no signal handlers; the
//! host decides when to call `shutdown()` (see [`crate::signal`]).

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Error, Result, SharedError};
use crate::event::{Event, EventRecord};
use crate::notify::{GatewayNotification, NotificationKind, Notifier, SubscriptionId};
use crate::queue::{
    AmqpBroker, Broker, ConnectionOptions, Job, JobProcessor, JobQueue, Worker, WorkerEvent,
    WorkerOptions,
};
use crate::strategy::{EventExtractor, EventHandler, PayloadExtractor};

/// Where a gateway is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

enum Lifecycle {
    Idle,
    Running {
        worker: Box<dyn Worker>,
        relay: JoinHandle<()>,
    },
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> GatewayState {
        match self {
            Self::Idle => GatewayState::Idle,
            Self::Running { .. } => GatewayState::Running,
            Self::Stopped => GatewayState::Stopped,
        }
    }
}

/// Converts delivered jobs into events and runs a handler on them.
pub struct ConsumerGateway<E: Event = EventRecord> {
    shared: Arc<Shared<E>>,
    connection: ConnectionOptions,
    worker_options: WorkerOptions,
    broker: Arc<dyn Broker>,
    lifecycle: Mutex<Lifecycle>,
}

/// State reachable from worker callbacks.
struct Shared<E: Event> {
    queue_name: String,
    handler: Arc<dyn EventHandler<E>>,
    extractor: Arc<dyn EventExtractor<E>>,
    notifier: Notifier<GatewayNotification<E>>,
}

/// Builder for [`ConsumerGateway`].
pub struct ConsumerGatewayBuilder<E: Event> {
    queue: Option<String>,
    queue_name: Option<String>,
    connection: Option<ConnectionOptions>,
    handler: Option<Arc<dyn EventHandler<E>>>,
    extractor: Option<Arc<dyn EventExtractor<E>>>,
    worker_options: WorkerOptions,
    broker: Option<Arc<dyn Broker>>,
}

impl<E: Event> Default for ConsumerGatewayBuilder<E> {
    fn default() -> Self {
        Self {
            queue: None,
            queue_name: None,
            connection: None,
            handler: None,
            extractor: None,
            worker_options: WorkerOptions::default(),
            broker: None,
        }
    }
}

impl<E: Event> ConsumerGatewayBuilder<E> {
    /// Consume the queue `queue` submits to.
    pub fn queue(mut self, queue: &dyn JobQueue) -> Self {
        self.queue = Some(queue.name().to_string());
        self
    }

    /// Consume the queue called `name`. Takes precedence over [`queue`](Self::queue).
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    /// Broker endpoint; defaults to the local one.
    pub fn connection(mut self, connection: ConnectionOptions) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn handler(mut self, handler: impl EventHandler<E> + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Rebuild events with `extractor` instead of reading the job payload.
    pub fn extractor(mut self, extractor: impl EventExtractor<E> + 'static) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    /// Worker tuning. Any connection set here is replaced by the gateway's.
    pub fn worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }

    /// Queue engine to run the worker on; defaults to [`AmqpBroker`].
    pub fn broker(mut self, broker: impl Broker + 'static) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    pub fn build(self) -> Result<ConsumerGateway<E>, ConfigError> {
        let queue_name = self
            .queue_name
            .or(self.queue)
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::MissingQueue)?;
        let handler = self.handler.ok_or(ConfigError::MissingHandler)?;

        Ok(ConsumerGateway {
            shared: Arc::new(Shared {
                queue_name,
                handler,
                extractor: self
                    .extractor
                    .unwrap_or_else(|| Arc::new(PayloadExtractor::new())),
                notifier: Notifier::new(),
            }),
            connection: self.connection.unwrap_or_default(),
            worker_options: self.worker_options,
            broker: self.broker.unwrap_or_else(|| Arc::new(AmqpBroker::new())),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }
}

impl<E: Event> ConsumerGateway<E> {
    pub fn builder() -> ConsumerGatewayBuilder<E> {
        ConsumerGatewayBuilder::default()
    }

    /// Name of the consumed queue.
    pub fn queue_name(&self) -> &str {
        &self.shared.queue_name
    }

    pub async fn state(&self) -> GatewayState {
        self.lifecycle.lock().await.state()
    }

    /// Subscribe to one notification kind.
    pub fn on<F>(&self, kind: NotificationKind, listener: F) -> SubscriptionId
    where
        F: Fn(&GatewayNotification<E>) + Send + Sync + 'static,
    {
        self.shared.notifier.on(kind, listener)
    }

    /// Subscribe to the next notification of one kind.
    pub fn once<F>(&self, kind: NotificationKind, listener: F) -> SubscriptionId
    where
        F: Fn(&GatewayNotification<E>) + Send + Sync + 'static,
    {
        self.shared.notifier.once(kind, listener)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.notifier.off(id)
    }

    /// Options the worker is started with: the caller's tuning, with the
    /// gateway's connection always taking precedence.
    pub fn effective_worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            connection: Some(self.connection.clone()),
            ..self.worker_options.clone()
        }
    }

    /// Start consuming. A no-op while running.
    ///
    /// # Errors
    ///
    /// [`Error::GatewayStopped`] after `shutdown()`, or [`Error::Queue`] if
    /// the worker could not be started (the gateway then stays idle).
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Stopped => return Err(Error::GatewayStopped),
            Lifecycle::Idle => {}
        }

        let shared = Arc::clone(&self.shared);
        let processor: JobProcessor = Arc::new(move |job: Job| -> BoxFuture<'static, Result<(), SharedError>> {
            let shared = Arc::clone(&shared);
            Box::pin(async move { shared.process(job).await })
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let worker = self
            .broker
            .worker(
                &self.shared.queue_name,
                self.effective_worker_options(),
                processor,
                events_tx,
            )
            .await?;

        let shared = Arc::clone(&self.shared);
        let relay = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                shared.relay(event);
            }
        });

        *lifecycle = Lifecycle::Running { worker, relay };
        info!(
            queue = %self.shared.queue_name,
            concurrency = self.worker_options.concurrency,
            "gateway_started"
        );
        Ok(())
    }

    /// Stop consuming and release the worker.
    ///
    /// Jobs already being processed finish first, and every notification they
    /// cause is emitted before this returns; nothing is emitted afterwards.
    /// A no-op on a gateway that was never started or is already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Running { .. }) {
            debug!(queue = %self.shared.queue_name, state = %lifecycle.state(), "gateway_shutdown_noop");
            return Ok(());
        }
        let Lifecycle::Running { worker, relay } = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        else {
            return Ok(());
        };

        info!(queue = %self.shared.queue_name, "gateway_stopping");

        let closed = worker.close().await;
        if let Err(e) = relay.await {
            warn!(queue = %self.shared.queue_name, error = %e, "gateway_relay_join_failed");
        }
        closed?;

        info!(queue = %self.shared.queue_name, "gateway_stopped");
        Ok(())
    }
}

impl<E: Event> Shared<E> {
    async fn process(&self, job: Job) -> Result<(), SharedError> {
        debug!(
            queue = %self.queue_name,
            job_id = %job.id,
            job_name = %job.name,
            attempts_made = job.attempts_made,
            "gateway_job_received"
        );
        self.notifier.emit(&GatewayNotification::JobReceived(job.clone()));

        let event = match self.extractor.extract(&job).await {
            Ok(event) => event,
            Err(e) => {
                let err: SharedError = Arc::new(Error::Extraction(e));
                warn!(queue = %self.queue_name, job_id = %job.id, error = %err, "gateway_extraction_failed");
                self.notifier.emit(&GatewayNotification::Error(job, Arc::clone(&err)));
                return Err(err);
            }
        };
        self.notifier.emit(&GatewayNotification::EventReceived(event.clone()));

        match self.handler.handle(&event).await {
            Ok(result) => {
                debug!(queue = %self.queue_name, event_id = %event.id(), "gateway_event_processed");
                self.notifier.emit(&GatewayNotification::EventProcessed(event, result));
                Ok(())
            }
            Err(e) => {
                let err: SharedError = Arc::new(Error::Handler(e));
                warn!(queue = %self.queue_name, event_id = %event.id(), error = %err, "gateway_handler_failed");
                self.notifier.emit(&GatewayNotification::EventError(event, Arc::clone(&err)));
                Err(err)
            }
        }
    }

    fn relay(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Completed(job) => {
                self.notifier.emit(&GatewayNotification::JobCompleted(job));
            }
            WorkerEvent::Failed(job, err) => {
                self.notifier.emit(&GatewayNotification::JobError(job, err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ProducerChannel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::error::BoxError;
    use crate::notify::{ChannelNotification, Notification};
    use crate::queue::{JobOptions, MemoryBroker};
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const WAIT_TIME: Duration = Duration::from_millis(1000);

    type Seen = Arc<StdMutex<Vec<GatewayNotification<EventRecord>>>>;

    fn record(gateway: &ConsumerGateway, kinds: &[NotificationKind]) -> Seen {
        let seen: Seen = Arc::new(StdMutex::new(Vec::new()));
        for kind in kinds {
            let sink = Arc::clone(&seen);
            gateway.on(*kind, move |n| sink.lock().unwrap().push(n.clone()));
        }
        seen
    }

    fn count(seen: &Seen, kind: NotificationKind) -> usize {
        seen.lock().unwrap().iter().filter(|n| n.kind() == kind).count()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT_TIME;
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn created_jobs(channel: &ProducerChannel) -> Arc<StdMutex<Vec<Job>>> {
        let jobs = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&jobs);
        channel.on(NotificationKind::JobCreated, move |n| {
            if let ChannelNotification::JobCreated(job) = n {
                sink.lock().unwrap().push(job.clone());
            }
        });
        jobs
    }

    fn recording_handler(
        calls: Arc<StdMutex<Vec<EventRecord>>>,
    ) -> impl Fn(&EventRecord) -> BoxFuture<'static, std::result::Result<Value, BoxError>> + Send + Sync {
        move |event: &EventRecord| -> BoxFuture<'static, std::result::Result<Value, BoxError>> {
            calls.lock().unwrap().push(event.clone());
            let id = event.id.clone();
            Box::pin(async move { Ok(json!({ "handled": id })) })
        }
    }

    fn failing_handler(
        event: &EventRecord,
    ) -> BoxFuture<'static, std::result::Result<Value, BoxError>> {
        let _ = event;
        Box::pin(async { Err("boom".into()) })
    }

    fn setup() -> (MemoryBroker, ProducerChannel) {
        let broker = MemoryBroker::new();
        let channel = ProducerChannel::new(broker.queue("test"));
        (broker, channel)
    }

    #[tokio::test]
    async fn test_handler_receives_event_once() {
        let (broker, channel) = setup();
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .handler(recording_handler(Arc::clone(&calls)))
            .build()
            .unwrap();
        let seen = record(&gateway, &[NotificationKind::EventProcessed]);
        gateway.start().await.unwrap();

        let event = EventRecord::with_id("e1").with_field("foo", 1);
        channel.send(event.clone()).await;
        wait_for(|| count(&seen, NotificationKind::EventProcessed) == 1).await;
        gateway.shutdown().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![event.clone()]);
        let seen = seen.lock().unwrap();
        match &seen[0] {
            GatewayNotification::EventProcessed(processed, result) => {
                assert_eq!(processed, &event);
                assert_eq!(result, &json!({"handled": "e1"}));
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_job_notifications_carry_created_job_id() {
        let (broker, channel) = setup();
        let created = created_jobs(&channel);
        let gateway = ConsumerGateway::builder()
            .queue(&broker.queue("test"))
            .broker(broker.clone())
            .handler(recording_handler(Arc::new(StdMutex::new(Vec::new()))))
            .build()
            .unwrap();
        let seen = record(
            &gateway,
            &[
                NotificationKind::JobReceived,
                NotificationKind::EventReceived,
                NotificationKind::JobCompleted,
            ],
        );
        gateway.start().await.unwrap();

        let event = EventRecord::new();
        channel.send(event.clone()).await;
        wait_for(|| count(&seen, NotificationKind::JobCompleted) == 1).await;
        gateway.shutdown().await.unwrap();

        let job_id = created.lock().unwrap()[0].id.clone();
        assert_eq!(job_id, event.id);

        let seen = seen.lock().unwrap();
        let kinds: Vec<_> = seen.iter().map(|n| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::JobReceived,
                NotificationKind::EventReceived,
                NotificationKind::JobCompleted,
            ]
        );
        assert!(matches!(&seen[0], GatewayNotification::JobReceived(job) if job.id == job_id));
        assert!(matches!(&seen[1], GatewayNotification::EventReceived(e) if *e == event));
        assert!(matches!(&seen[2], GatewayNotification::JobCompleted(job) if job.id == job_id));
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_and_fails_job() {
        let (broker, channel) = setup();
        let created = created_jobs(&channel);
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .handler(failing_handler)
            .build()
            .unwrap();
        let seen = record(&gateway, &[NotificationKind::EventError, NotificationKind::JobError]);
        gateway.start().await.unwrap();

        let event = EventRecord::with_id("e2");
        channel.send(event.clone()).await;
        wait_for(|| count(&seen, NotificationKind::JobError) == 1).await;
        gateway.shutdown().await.unwrap();

        let job_id = created.lock().unwrap()[0].id.clone();
        let seen = seen.lock().unwrap();
        let (GatewayNotification::EventError(failed, event_err), GatewayNotification::JobError(job, job_err)) =
            (&seen[0], &seen[1])
        else {
            panic!("unexpected notifications {seen:?}");
        };

        assert_eq!(failed, &event);
        assert_eq!(event_err.to_string(), "handler failed: boom");
        assert_eq!(job.id, job_id);
        assert!(Arc::ptr_eq(event_err, job_err));
        assert_eq!(broker.queue("test").failed(), vec![job_id]);
    }

    #[tokio::test]
    async fn test_queue_retries_failed_jobs() {
        let (broker, channel) = setup();
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .handler(failing_handler)
            .build()
            .unwrap();
        let seen = record(&gateway, &[NotificationKind::EventError, NotificationKind::JobError]);
        gateway.start().await.unwrap();

        channel
            .send_with_options(EventRecord::with_id("e3"), Some(JobOptions::default().with_attempts(2)))
            .await;
        wait_for(|| count(&seen, NotificationKind::JobError) == 2).await;
        gateway.shutdown().await.unwrap();

        assert_eq!(count(&seen, NotificationKind::EventError), 2);
        let attempts: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|n| match n {
                GatewayNotification::JobError(job, _) => Some(job.attempts_made),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_custom_extractor_replaces_payload() {
        let (broker, channel) = setup();
        let created = created_jobs(&channel);
        let fixed = EventRecord::with_id("fixed").with_field("source", "extractor");
        let extracted_from = Arc::new(StdMutex::new(Vec::new()));

        let sink = Arc::clone(&extracted_from);
        let replacement = fixed.clone();
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .handler(recording_handler(Arc::new(StdMutex::new(Vec::new()))))
            .extractor(move |job: &Job| {
                sink.lock().unwrap().push(job.clone());
                let event = replacement.clone();
                async move { Ok::<_, BoxError>(event) }
            })
            .build()
            .unwrap();
        let seen = record(&gateway, &[NotificationKind::EventReceived]);
        gateway.start().await.unwrap();

        let event = EventRecord::with_id("e4").with_field("foo", 1);
        channel.send(event.clone()).await;
        wait_for(|| count(&seen, NotificationKind::EventReceived) == 1).await;
        gateway.shutdown().await.unwrap();

        assert!(matches!(&seen.lock().unwrap()[0], GatewayNotification::EventReceived(e) if *e == fixed));
        let jobs = extracted_from.lock().unwrap();
        assert_eq!(jobs[0].id, created.lock().unwrap()[0].id);
        assert_eq!(jobs[0].data, serde_json::to_value(&event).unwrap());
    }

    #[tokio::test]
    async fn test_extraction_failure_fails_job_without_handler() {
        let (broker, channel) = setup();
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .handler(recording_handler(Arc::clone(&calls)))
            .extractor(|_: &Job| async { Err::<EventRecord, BoxError>("unreadable".into()) })
            .build()
            .unwrap();
        let seen = record(
            &gateway,
            &[NotificationKind::Error, NotificationKind::EventReceived, NotificationKind::JobError],
        );
        gateway.start().await.unwrap();

        channel.send(EventRecord::with_id("e5")).await;
        wait_for(|| count(&seen, NotificationKind::JobError) == 1).await;
        gateway.shutdown().await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(count(&seen, NotificationKind::EventReceived), 0);
        let seen = seen.lock().unwrap();
        match &seen[0] {
            GatewayNotification::Error(job, err) => {
                assert_eq!(job.id, "e5");
                assert_eq!(err.to_string(), "event extraction failed: unreadable");
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_without_start_is_noop() {
        let (broker, channel) = setup();
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .handler(recording_handler(Arc::new(StdMutex::new(Vec::new()))))
            .build()
            .unwrap();
        let all = [
            NotificationKind::JobReceived,
            NotificationKind::EventReceived,
            NotificationKind::EventProcessed,
            NotificationKind::EventError,
            NotificationKind::Error,
            NotificationKind::JobCompleted,
            NotificationKind::JobError,
        ];
        let seen = record(&gateway, &all);

        gateway.shutdown().await.unwrap();
        gateway.shutdown().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Idle);

        channel.send(EventRecord::with_id("e6")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_notifications_after_shutdown() {
        let (broker, channel) = setup();
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .handler(recording_handler(Arc::new(StdMutex::new(Vec::new()))))
            .build()
            .unwrap();
        let seen = record(&gateway, &[NotificationKind::JobReceived, NotificationKind::JobCompleted]);

        gateway.start().await.unwrap();
        gateway.shutdown().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Stopped);

        channel.send(EventRecord::with_id("e7")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(broker.queue("test").waiting_count(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let broker = MemoryBroker::new();
        let gateway = ConsumerGateway::<EventRecord>::builder()
            .queue_name("test")
            .broker(broker)
            .handler(recording_handler(Arc::new(StdMutex::new(Vec::new()))))
            .build()
            .unwrap();

        assert_eq!(gateway.state().await, GatewayState::Idle);
        gateway.start().await.unwrap();
        gateway.start().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Running);

        gateway.shutdown().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Stopped);
        assert!(matches!(gateway.start().await, Err(Error::GatewayStopped)));
    }

    #[test]
    fn test_build_requires_queue_and_handler() {
        let missing_queue = ConsumerGateway::<EventRecord>::builder()
            .handler(failing_handler)
            .build();
        assert_eq!(missing_queue.err(), Some(ConfigError::MissingQueue));

        let missing_handler = ConsumerGateway::<EventRecord>::builder()
            .queue_name("test")
            .build();
        assert_eq!(missing_handler.err(), Some(ConfigError::MissingHandler));
    }

    #[test]
    fn test_queue_name_resolution() {
        let broker = MemoryBroker::new();

        let from_queue = ConsumerGateway::<EventRecord>::builder()
            .queue(&broker.queue("orders"))
            .handler(failing_handler)
            .build()
            .unwrap();
        assert_eq!(from_queue.queue_name(), "orders");

        let explicit = ConsumerGateway::<EventRecord>::builder()
            .queue(&broker.queue("orders"))
            .queue_name("billing")
            .handler(failing_handler)
            .build()
            .unwrap();
        assert_eq!(explicit.queue_name(), "billing");
    }

    #[test]
    fn test_connection_wins_over_worker_options() {
        let gateway = ConsumerGateway::<EventRecord>::builder()
            .queue_name("test")
            .connection(ConnectionOptions::new("broker.internal", 5673))
            .worker_options(WorkerOptions {
                connection: Some(ConnectionOptions::new("elsewhere", 1)),
                ..WorkerOptions::default().with_concurrency(8)
            })
            .handler(failing_handler)
            .build()
            .unwrap();

        let options = gateway.effective_worker_options();
        assert_eq!(options.connection, Some(ConnectionOptions::new("broker.internal", 5673)));
        assert_eq!(options.concurrency, 8);

        let defaulted = ConsumerGateway::<EventRecord>::builder()
            .queue_name("test")
            .handler(failing_handler)
            .build()
            .unwrap();
        assert_eq!(
            defaulted.effective_worker_options().connection,
            Some(ConnectionOptions::default())
        );
    }

    struct SlowHandler {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler<EventRecord> for SlowHandler {
        async fn handle(&self, event: &EventRecord) -> std::result::Result<Value, BoxError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "handled": event.id }))
        }
    }

    #[tokio::test]
    async fn test_handlers_overlap_up_to_concurrency() {
        let (broker, channel) = setup();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .worker_options(WorkerOptions::default().with_concurrency(2))
            .handler(SlowHandler {
                running: Arc::clone(&running),
                peak: Arc::clone(&peak),
            })
            .build()
            .unwrap();
        let seen = record(&gateway, &[NotificationKind::EventProcessed]);
        gateway.start().await.unwrap();

        for id in ["e1", "e2", "e3"] {
            channel.send(EventRecord::with_id(id)).await;
        }
        wait_for(|| count(&seen, NotificationKind::EventProcessed) == 3).await;
        gateway.shutdown().await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    struct JobTaggingExtractor;

    #[async_trait]
    impl EventExtractor<EventRecord> for JobTaggingExtractor {
        async fn extract(&self, job: &Job) -> std::result::Result<EventRecord, BoxError> {
            let event: EventRecord = serde_json::from_value(job.data.clone())?;
            Ok(event.with_field("job", job.id.clone()))
        }
    }

    #[tokio::test]
    async fn test_extractor_object_is_used() {
        let (broker, channel) = setup();
        let created = created_jobs(&channel);
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let gateway = ConsumerGateway::builder()
            .queue_name("test")
            .broker(broker.clone())
            .extractor(JobTaggingExtractor)
            .handler(recording_handler(Arc::clone(&calls)))
            .build()
            .unwrap();
        let seen = record(&gateway, &[NotificationKind::EventProcessed]);
        gateway.start().await.unwrap();

        channel.send(EventRecord::with_id("e6")).await;
        wait_for(|| count(&seen, NotificationKind::EventProcessed) == 1).await;
        gateway.shutdown().await.unwrap();

        let job_id = created.lock().unwrap()[0].id.clone();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "e6");
        assert_eq!(calls[0].field("job"), Some(&json!(job_id)));
    }
}
