//! Prometheus metrics exporter.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use tracing::{error, info};

use crate::error::MetricsError;

/// Prometheus metrics for the image processor.
pub struct Metrics {
    /// Registry for all metrics.
    registry: Registry,
    /// Tasks by final outcome.
    pub tasks_total: CounterVec,
    /// Images successfully compressed and uploaded.
    pub images_processed: Counter,
    /// Individual image attempts that failed (including retried ones).
    pub image_attempt_failures: Counter,
    /// Dead-letter records published.
    pub dead_letter_published: Counter,
    /// Dead-letter records that could not be published.
    pub dead_letter_failures: Counter,
    /// Wall-clock time per task.
    pub task_duration_seconds: Histogram,
    /// Tasks currently being processed.
    pub tasks_in_progress: Gauge,
}

fn registration(e: prometheus::Error) -> MetricsError {
    MetricsError::Registration(e.to_string())
}

impl Metrics {
    /// Creates a new metrics instance with its own registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let tasks_total = CounterVec::new(
            Opts::new("image_tasks_total", "Image tasks handled, by outcome"),
            &["outcome"],
        )
        .map_err(registration)?;

        let images_processed = Counter::new(
            "images_processed_total",
            "Images compressed and uploaded",
        )
        .map_err(registration)?;

        let image_attempt_failures = Counter::new(
            "image_attempt_failures_total",
            "Failed single-image attempts, including ones later retried",
        )
        .map_err(registration)?;

        let dead_letter_published = Counter::new(
            "dead_letter_published_total",
            "Dead-letter records published",
        )
        .map_err(registration)?;

        let dead_letter_failures = Counter::new(
            "dead_letter_publish_failures_total",
            "Dead-letter records that failed to publish",
        )
        .map_err(registration)?;

        let task_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "image_task_duration_seconds",
                "Time taken to process one task in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .map_err(registration)?;

        let tasks_in_progress = Gauge::new(
            "image_tasks_in_progress",
            "Tasks currently being processed",
        )
        .map_err(registration)?;

        registry
            .register(Box::new(tasks_total.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(images_processed.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(image_attempt_failures.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(dead_letter_published.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(dead_letter_failures.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(task_duration_seconds.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(tasks_in_progress.clone()))
            .map_err(registration)?;

        Ok(Self {
            registry,
            tasks_total,
            images_processed,
            image_attempt_failures,
            dead_letter_published,
            dead_letter_failures,
            task_duration_seconds,
            tasks_in_progress,
        })
    }

    /// Records a finished task.
    pub fn record_task(&self, outcome: &str, duration_secs: f64) {
        self.tasks_total.with_label_values(&[outcome]).inc();
        self.task_duration_seconds.observe(duration_secs);
    }

    /// Records one uploaded image.
    pub fn record_image(&self) {
        self.images_processed.inc();
    }

    /// Records one failed image attempt.
    pub fn record_attempt_failure(&self) {
        self.image_attempt_failures.inc();
    }

    /// Records a published dead-letter record.
    pub fn record_dead_letter(&self) {
        self.dead_letter_published.inc();
    }

    /// Records a dead-letter record that could not be published.
    pub fn record_dead_letter_failure(&self) {
        self.dead_letter_failures.inc();
    }

    /// Marks a task as started or finished.
    pub fn set_in_progress(&self, active: bool) {
        self.tasks_in_progress.set(if active { 1.0 } else { 0.0 });
    }

    /// Returns how many tasks ended with the given outcome.
    pub fn tasks_with_outcome(&self, outcome: &str) -> u64 {
        self.tasks_total.with_label_values(&[outcome]).get() as u64
    }

    /// Returns how many dead-letter records were published.
    pub fn dead_letters_published(&self) -> u64 {
        self.dead_letter_published.get() as u64
    }

    /// Returns the metrics in Prometheus text format.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
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
    pub async fn start(self) -> Result<(), MetricsError> {
        use http_body_util::Full;
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{body::Incoming, Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| MetricsError::Server(e.to_string()))?;

        info!(port = self.port, "Starting Prometheus metrics server");

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| MetricsError::Server(e.to_string()))?;

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    async move {
                        if req.uri().path() == "/metrics" {
                            return Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(
                                metrics.gather(),
                            ))));
                        }
                        let mut response = Response::new(Full::new(Bytes::from("Not Found")));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        Ok(response)
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving connection");
                }
            });
        }
    }
}
