//! RabbitMQ worker using lapin.
//!
//! Each worker opens its own connection, consumes the durable queue with a
//! prefetch equal to its concurrency, and spawns a task per delivery. The
//! retry policy lives in the job itself:
//! 1. Processor succeeds: ack, report `Completed`
//! 2. Processor fails with attempts left: wait `backoff_ms`, re-publish with
//!    `attempts_made + 1`, ack the original, report `Failed`
//! 3. Processor fails on its last attempt: reject without requeue (so a
//!    configured dead-letter exchange receives it), report `Failed`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::publisher::{declare_queue, publish_job};
use super::{Broker, Job, JobProcessor, Worker, WorkerEvent, WorkerEvents, WorkerOptions};
use crate::error::QueueError;

/// Broker that runs workers against RabbitMQ.
///
/// The connection comes from [`WorkerOptions::connection`], falling back to
/// the default local endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn worker(
        &self,
        queue_name: &str,
        options: WorkerOptions,
        processor: JobProcessor,
        events: WorkerEvents,
    ) -> Result<Box<dyn Worker>, QueueError> {
        let connection = options.connection.clone().unwrap_or_default();
        let concurrency = options.concurrency.clamp(1, u16::MAX as usize);
        let subscribe_err = |reason: String| QueueError::Subscribe {
            queue: queue_name.to_string(),
            reason,
        };

        info!(host = %connection.host, port = connection.port, queue = queue_name, "amqp_worker_connecting");

        let conn = Connection::connect(&connection.to_url(), ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        // Prefetch matches concurrency so the broker never hands us more than
        // we will process at once.
        let prefetch_count = concurrency as u16;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;

        declare_queue(&channel, queue_name).await?;

        let consumer_tag = format!("eventq-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;

        info!(queue = queue_name, prefetch_count = prefetch_count, "amqp_worker_started");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            WorkerContext {
                queue: queue_name.to_string(),
                consumer_tag,
                connection: conn,
                channel,
                processor,
                events,
            },
            consumer,
            concurrency,
            shutdown_rx,
        ));

        Ok(Box::new(AmqpWorker {
            queue: queue_name.to_string(),
            shutdown: shutdown_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }))
    }
}

struct AmqpWorker {
    queue: String,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Worker for AmqpWorker {
    async fn close(&self) -> Result<(), QueueError> {
        self.shutdown.send_replace(true);

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(queue = %self.queue, error = %e, "amqp_worker_join_failed");
            }
        }
        Ok(())
    }
}

struct WorkerContext {
    queue: String,
    consumer_tag: String,
    connection: Connection,
    channel: Channel,
    processor: JobProcessor,
    events: WorkerEvents,
}

/// Consume deliveries until shutdown, then drain in-flight jobs and release
/// the connection this worker opened.
async fn run(
    ctx: WorkerContext,
    mut consumer: Consumer,
    concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(concurrency));

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => {
                info!(queue = %ctx.queue, "amqp_worker_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let permit = match Arc::clone(&permits).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let channel = ctx.channel.clone();
                        let processor = Arc::clone(&ctx.processor);
                        let events = ctx.events.clone();
                        tokio::spawn(async move {
                            handle_delivery(&channel, &processor, &events, delivery).await;
                            drop(events);
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        error!(queue = %ctx.queue, error = %e, "amqp_delivery_error");
                    }
                    None => {
                        warn!(queue = %ctx.queue, "amqp_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = ctx
        .channel
        .basic_cancel(&ctx.consumer_tag, BasicCancelOptions::default())
        .await
    {
        warn!(queue = %ctx.queue, error = %e, "amqp_consumer_cancel_error");
    }

    if permits.acquire_many(concurrency as u32).await.is_err() {
        warn!(queue = %ctx.queue, "amqp_worker_drain_failed");
    }

    if let Err(e) = ctx.channel.close(200, "Normal shutdown").await {
        warn!(error = %e, "amqp_channel_close_error");
    }
    if let Err(e) = ctx.connection.close(200, "Normal shutdown").await {
        warn!(error = %e, "amqp_connection_close_error");
    }

    info!(queue = %ctx.queue, "amqp_worker_shutdown_complete");
}

async fn handle_delivery(
    channel: &Channel,
    processor: &JobProcessor,
    events: &WorkerEvents,
    delivery: Delivery,
) {
    let delivery_tag = delivery.delivery_tag;

    let job: Job = match serde_json::from_slice(&delivery.data) {
        Ok(job) => job,
        Err(e) => {
            error!(delivery_tag = delivery_tag, error = %e, "amqp_job_parse_failed");
            // An unparseable body will never succeed; do not requeue it.
            nack(channel, delivery_tag).await;
            return;
        }
    };

    info!(
        queue = %job.queue,
        job_id = %job.id,
        job_name = %job.name,
        delivery_tag = delivery_tag,
        "amqp_job_received"
    );

    match processor(job.clone()).await {
        Ok(()) => {
            ack(channel, delivery_tag).await;
            info!(queue = %job.queue, job_id = %job.id, "amqp_job_completed");
            let _ = events.send(WorkerEvent::Completed(job));
        }
        Err(err) => {
            let mut job = job;
            job.attempts_made += 1;

            if job.can_retry() {
                if let Some(backoff) = job.opts.backoff_ms.filter(|ms| *ms > 0) {
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                match publish_job(channel, &job).await {
                    Ok(()) => ack(channel, delivery_tag).await,
                    Err(e) => {
                        // Fall back to a plain requeue; the attempt is not counted.
                        error!(job_id = %job.id, error = %e, "amqp_job_retry_publish_failed");
                        requeue(channel, delivery_tag).await;
                    }
                }
            } else {
                nack(channel, delivery_tag).await;
            }

            warn!(
                queue = %job.queue,
                job_id = %job.id,
                attempts_made = job.attempts_made,
                max_attempts = job.max_attempts(),
                error = %err,
                "amqp_job_failed"
            );
            let _ = events.send(WorkerEvent::Failed(job, err));
        }
    }
}

async fn ack(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_ack(delivery_tag, BasicAckOptions::default())
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "amqp_ack_failed");
    }
}

async fn nack(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_nack(delivery_tag, BasicNackOptions::default())
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "amqp_nack_failed");
    }
}

async fn requeue(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue: true,
                ..Default::default()
            },
        )
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "amqp_nack_failed");
    }
}
