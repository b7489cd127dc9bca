//! Prometheus metrics for the dispatcher.
//!
//! Metrics are emitted through the `metrics` facade and are no-ops until a
//! recorder is installed; [`MetricsServer`] installs the Prometheus one.
//!
//! # Example
//!
//! ```rust,no_run
//! use composable_outbox_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics exporter.
///
/// Serves the scrape endpoint on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the Prometheus recorder and spawn
    /// the HTTP scrape endpoint.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. by another test) this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "outbox_messages_claimed_total",
        "Total number of outbox messages claimed by dispatchers"
    );
    describe_counter!(
        "outbox_consumer_deliveries_total",
        "Total number of successful consumer deliveries"
    );
    describe_counter!(
        "outbox_consumer_failures_total",
        "Total number of failed consumer deliveries"
    );
    describe_counter!(
        "outbox_messages_processed_total",
        "Total number of messages marked processed"
    );
    describe_counter!(
        "outbox_poll_errors_total",
        "Total number of poll cycles that failed with a storage error"
    );
    describe_histogram!(
        "outbox_consumer_duration_seconds",
        "Time taken by a consumer handler"
    );
    describe_histogram!(
        "outbox_poll_duration_seconds",
        "Time taken by one poll cycle"
    );
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record messages claimed by one poll.
    pub fn record_claimed(count: usize) {
        counter!("outbox_messages_claimed_total").increment(count as u64);
    }

    /// Record a successful delivery to `consumer`.
    pub fn record_delivery(consumer: &str, duration: Duration) {
        counter!("outbox_consumer_deliveries_total", "consumer" => consumer.to_string()).increment(1);
        histogram!("outbox_consumer_duration_seconds", "consumer" => consumer.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a failed delivery to `consumer`.
    pub fn record_failure(consumer: &str, duration: Duration) {
        counter!("outbox_consumer_failures_total", "consumer" => consumer.to_string()).increment(1);
        histogram!("outbox_consumer_duration_seconds", "consumer" => consumer.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a message reaching the processed state.
    pub fn record_processed() {
        counter!("outbox_messages_processed_total").increment(1);
    }

    /// Record a completed poll cycle.
    pub fn record_poll(duration: Duration) {
        histogram!("outbox_poll_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a poll cycle that failed.
    pub fn record_poll_error() {
        counter!("outbox_poll_errors_total").increment(1);
    }
}
