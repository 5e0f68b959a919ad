//! EventQ Worker - consumes bridged events from a RabbitMQ queue.
//!
//! Runs a `ConsumerGateway` that logs every event it receives, until SIGINT or
//! SIGTERM arrives.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use eventq::signal::shutdown_signal;
use eventq::{
    AmqpBroker, BoxError, Config, ConsumerGateway, EventRecord, GatewayNotification,
    NotificationKind,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        host = %config.connection.host,
        port = config.connection.port,
        queue = %config.queue,
        concurrency = config.worker_concurrency,
        "config_loaded"
    );

    let gateway = ConsumerGateway::<EventRecord>::builder()
        .queue_name(&config.queue)
        .connection(config.connection.clone())
        .worker_options(config.worker_options())
        .broker(AmqpBroker::new())
        .handler(log_event)
        .build()
        .context("Invalid gateway configuration")?;

    gateway.on(NotificationKind::JobError, |notification| {
        if let GatewayNotification::JobError(job, err) = notification {
            error!(
                job_id = %job.id,
                attempts_made = job.attempts_made,
                max_attempts = job.max_attempts(),
                error = %err,
                "worker_job_failed"
            );
        }
    });

    gateway.start().await.context("Failed to start gateway")?;
    info!("worker_ready");

    shutdown_signal().await;

    info!("worker_stopping");
    gateway.shutdown().await.context("Failed to shut down gateway")?;
    info!("worker_shutdown_complete");

    Ok(())
}

/// Log the event and report how many payload fields it carried.
fn log_event(event: &EventRecord) -> BoxFuture<'static, Result<Value, BoxError>> {
    let id = event.id.clone();
    let fields = event.fields.len();
    Box::pin(async move {
        info!(event_id = %id, fields = fields, "worker_event_handled");
        Ok(json!({ "fields": fields }))
    })
}
