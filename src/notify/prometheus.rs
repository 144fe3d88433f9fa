//! Prometheus metrics exporter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use tracing::{error, info};

use crate::error::NotificationError;
use crate::queue::JobCounts;

/// Prometheus metrics for the mail queues.
pub struct Metrics {
    /// Registry for all metrics.
    registry: Registry,
    /// Jobs by queue and outcome (enqueued, completed, retried, failed, dead_lettered).
    pub jobs_total: IntCounterVec,
    /// Attempt duration in seconds.
    pub job_duration_seconds: HistogramVec,
    /// Attempts currently running.
    pub jobs_in_flight: IntGaugeVec,
    /// Jobs per queue and state, refreshed by the stats loop.
    pub queue_depth: GaugeVec,
}

fn prom_err(e: prometheus::Error) -> NotificationError {
    NotificationError::PrometheusFailed(e.to_string())
}

impl Metrics {
    /// Creates a new metrics instance with all gauges and counters.
    pub fn new() -> Result<Self, NotificationError> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("mailq_jobs_total", "Total number of jobs by outcome"),
            &["queue", "outcome"],
        )
        .map_err(prom_err)?;

        let job_duration_seconds = HistogramVec::new(
            HistogramOpts::new("mailq_job_duration_seconds", "Time taken by a single attempt")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["queue"],
        )
        .map_err(prom_err)?;

        let jobs_in_flight = IntGaugeVec::new(
            Opts::new("mailq_jobs_in_flight", "Number of attempts currently running"),
            &["queue"],
        )
        .map_err(prom_err)?;

        let queue_depth = GaugeVec::new(
            Opts::new("mailq_queue_depth", "Number of jobs per queue state"),
            &["queue", "state"],
        )
        .map_err(prom_err)?;

        registry
            .register(Box::new(jobs_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(job_duration_seconds.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(jobs_in_flight.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            jobs_total,
            job_duration_seconds,
            jobs_in_flight,
            queue_depth,
        })
    }

    /// Records a job written to the store.
    pub fn record_enqueued(&self, queue: &str) {
        self.record_outcome(queue, "enqueued");
    }

    /// Records the final effect of an attempt.
    pub fn record_outcome(&self, queue: &str, outcome: &str) {
        self.jobs_total.with_label_values(&[queue, outcome]).inc();
    }

    /// Marks an attempt as running.
    pub fn job_started(&self, queue: &str) {
        self.jobs_in_flight.with_label_values(&[queue]).inc();
    }

    /// Marks an attempt as finished after `elapsed`.
    pub fn job_finished(&self, queue: &str, elapsed: Duration) {
        self.jobs_in_flight.with_label_values(&[queue]).dec();
        self.job_duration_seconds
            .with_label_values(&[queue])
            .observe(elapsed.as_secs_f64());
    }

    /// Updates the depth gauges of a queue.
    pub fn set_queue_depth(&self, queue: &str, counts: &JobCounts) {
        for (state, count) in [
            ("waiting", counts.waiting),
            ("active", counts.active),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ] {
            self.queue_depth
                .with_label_values(&[queue, state])
                .set(count as f64);
        }
    }

    /// Returns the metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String, NotificationError> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| NotificationError::PrometheusFailed(e.to_string()))
    }
}

/// HTTP server for Prometheus metrics.
pub struct MetricsServer {
    /// Metrics instance.
    metrics: Arc<Metrics>,
    /// Port to listen on.
    port: u16,
}

impl MetricsServer {
    /// Creates a new metrics server.
    pub fn new(metrics: Arc<Metrics>, port: u16) -> Self {
        Self { metrics, port }
    }

    /// Starts the metrics HTTP server.
    pub async fn start(self) -> Result<(), NotificationError> {
        use http_body_util::Full;
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{body::Incoming, Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

        info!(port = self.port, "Starting Prometheus metrics server");

        let metrics = self.metrics.clone();

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

            let io = TokioIo::new(stream);
            let metrics = metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    async move {
                        let (status, body) = if req.uri().path() != "/metrics" {
                            (StatusCode::NOT_FOUND, "Not Found".to_string())
                        } else {
                            match metrics.gather() {
                                Ok(body) => (StatusCode::OK, body),
                                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        };

                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        *response.status_mut() = status;
                        Ok::<_, hyper::Error>(response)
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving connection");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_labelled_by_queue() {
        let metrics = Metrics::new().unwrap();
        metrics.record_enqueued("email");
        metrics.record_outcome("email", "completed");
        metrics.record_outcome("email", "completed");

        assert_eq!(
            metrics
                .jobs_total
                .with_label_values(&["email", "completed"])
                .get(),
            2
        );
        let text = metrics.gather().unwrap();
        assert!(text.contains("mailq_jobs_total"));
        assert!(text.contains("outcome=\"enqueued\""));
    }

    #[test]
    fn in_flight_returns_to_zero() {
        let metrics = Metrics::new().unwrap();
        metrics.job_started("dlq");
        metrics.job_started("dlq");
        metrics.job_finished("dlq", Duration::from_millis(20));
        assert_eq!(metrics.jobs_in_flight.with_label_values(&["dlq"]).get(), 1);
        metrics.job_finished("dlq", Duration::from_millis(20));
        assert_eq!(metrics.jobs_in_flight.with_label_values(&["dlq"]).get(), 0);
    }

    #[test]
    fn depth_gauges_follow_counts() {
        let metrics = Metrics::new().unwrap();
        metrics.set_queue_depth(
            "email",
            &JobCounts {
                waiting: 4,
                active: 1,
                completed: 10,
                failed: 2,
            },
        );
        assert_eq!(
            metrics
                .queue_depth
                .with_label_values(&["email", "waiting"])
                .get(),
            4.0
        );
    }
}
