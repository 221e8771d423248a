use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tripdesk_jobs::{app_state, config::AppConfig, services::queue::JobQueue};

/// How often completed jobs are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Completed jobs older than this are removed by the sweep.
const PURGE_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting job dispatcher worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    tracing::info!("Connecting to job store");
    let queue = Arc::new(app_state::build_queue(&config).expect("Failed to initialize job queue"));

    tracing::info!(
        kinds = ?queue.registry().kinds(),
        interval_secs = config.dispatch_interval_secs,
        timeout_secs = queue.registry().timeout().as_secs(),
        "Worker ready, starting dispatch loop"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let purger = tokio::spawn(purge_loop(queue.clone(), shutdown_rx.clone()));

    let mut dispatcher = {
        let queue = queue.clone();
        let interval = config.dispatch_interval();
        tokio::spawn(async move { queue.run(interval, shutdown_rx).await })
    };

    let dispatcher_exited = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested, finishing current tick");
            false
        }
        exited = &mut dispatcher => {
            match exited {
                Ok(()) => tracing::error!("Dispatcher stopped unexpectedly, shutting down worker"),
                Err(e) => tracing::error!(error = %e, "Dispatcher task panicked, shutting down worker"),
            }
            true
        }
    };
    let _ = shutdown_tx.send(true);

    if !dispatcher_exited {
        if let Err(e) = dispatcher.await {
            tracing::error!(error = %e, "Dispatcher task panicked");
        }
    }
    if let Err(e) = purger.await {
        tracing::error!(error = %e, "Purge task panicked");
    }
}

/// Periodically drop old completed jobs.
async fn purge_loop(queue: Arc<JobQueue>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = queue.purge_completed(PURGE_AGE).await {
                    tracing::warn!(error = %e, "Completed job purge failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn describe_metrics() {
    metrics::describe_counter!("jobs_enqueued_total", "Jobs written to the pending index");
    metrics::describe_counter!("jobs_completed_total", "Jobs whose action succeeded");
    metrics::describe_counter!("jobs_failed_total", "Jobs moved to the dead letter set");
    metrics::describe_counter!("jobs_retried_total", "Failed attempts rescheduled for retry");
    metrics::describe_counter!(
        "jobs_immediate_total",
        "Jobs executed synchronously because the store was unreachable"
    );
    metrics::describe_counter!("jobs_reclaimed_total", "Jobs reclaimed after their lease expired");
    metrics::describe_counter!(
        "payments_retry_success_total",
        "Charge retries accepted by the payment gateway"
    );
    metrics::describe_histogram!("job_execution_seconds", "Time spent in a job action");
    metrics::describe_gauge!("jobs_pending", "Current number of jobs in the pending index");
}
