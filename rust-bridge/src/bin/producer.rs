//! EventQ Producer - sends events to a RabbitMQ queue.
//!
//! This binary:
//! 1. Reads newline-delimited JSON events (each with an `id`) from stdin
//! 2. Sends each through a `ProducerChannel` as a job on the configured queue
//! 3. Stops at end of input or on SIGINT/SIGTERM
//!
//! Failed sends are logged and skipped; they never stop the stream.

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use eventq::signal::shutdown_signal;
use eventq::{AmqpQueue, ChannelNotification, Config, EventRecord, NotificationKind, ProducerChannel};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("producer_starting");

    let config = Config::from_env();
    info!(
        host = %config.connection.host,
        port = config.connection.port,
        queue = %config.queue,
        attempts = config.job_attempts,
        "config_loaded"
    );

    let queue = AmqpQueue::new(&config.queue, &config.connection);
    let channel = ProducerChannel::<EventRecord>::new(queue.clone());

    channel.on(NotificationKind::JobCreated, |notification| {
        if let ChannelNotification::JobCreated(job) = notification {
            info!(job_id = %job.id, job_name = %job.name, "producer_job_created");
        }
    });
    channel.on(NotificationKind::EventError, |notification| {
        if let ChannelNotification::EventError(event, err) = notification {
            error!(event_id = %event.id, error = %err, "producer_send_failed");
        }
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(io::stdin()).lines();
    let mut sent = 0usize;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("producer_stopping");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<EventRecord>(&line) {
                    Ok(event) => {
                        channel.send_with_options(event, Some(config.job_options())).await;
                        sent += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, line_length = line.len(), "producer_event_parse_failed");
                    }
                }
            }
        }
    }

    queue.close().await;
    info!(sent = sent, "producer_shutdown_complete");

    Ok(())
}
