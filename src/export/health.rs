use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};

use crate::collector::{CollectError, Scrape};

const NAMESPACE: &str = "azure_exporter";

/// Prometheus metrics describing the exporter itself.
///
/// Kept in a separate registry from the Azure observations and appended to
/// every `/metrics` response.
pub struct HealthMetrics {
    registry: Registry,

    /// Total collection passes started.
    pub scrapes_total: Counter,
    /// Failed collection passes by failing stage.
    pub scrape_errors_total: CounterVec,
    /// Duration of a whole collection pass.
    pub scrape_duration: Histogram,
    /// Resources queried by the last successful pass.
    pub resources_collected: Gauge,
    /// Resources skipped by the last successful pass.
    pub resources_skipped: Gauge,
    /// Batch calls by kind (lookup/metrics) and status.
    pub batch_requests_total: CounterVec,
    /// Azure API requests by endpoint and status.
    pub api_requests_total: CounterVec,
    /// Azure API request duration by endpoint.
    pub api_request_duration: HistogramVec,
}

impl HealthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let scrapes_total = Counter::with_opts(
            Opts::new("scrapes_total", "Total collection passes started.").namespace(NAMESPACE),
        )?;
        let scrape_errors_total = CounterVec::new(
            Opts::new(
                "scrape_errors_total",
                "Total failed collection passes by failing stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let scrape_duration = Histogram::with_opts(
            HistogramOpts::new(
                "scrape_duration_seconds",
                "Duration of a collection pass.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let resources_collected = Gauge::with_opts(
            Opts::new(
                "resources_collected",
                "Resources queried by the last successful collection pass.",
            )
            .namespace(NAMESPACE),
        )?;
        let resources_skipped = Gauge::with_opts(
            Opts::new(
                "resources_skipped",
                "Resources skipped by the last successful collection pass.",
            )
            .namespace(NAMESPACE),
        )?;
        let batch_requests_total = CounterVec::new(
            Opts::new(
                "batch_requests_total",
                "Total Azure batch calls by kind and status.",
            )
            .namespace(NAMESPACE),
            &["kind", "status"],
        )?;
        let api_requests_total = CounterVec::new(
            Opts::new(
                "api_requests_total",
                "Total Azure API requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let api_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "api_request_duration_seconds",
                "Azure API request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["endpoint"],
        )?;

        registry.register(Box::new(scrapes_total.clone()))?;
        registry.register(Box::new(scrape_errors_total.clone()))?;
        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(resources_collected.clone()))?;
        registry.register(Box::new(resources_skipped.clone()))?;
        registry.register(Box::new(batch_requests_total.clone()))?;
        registry.register(Box::new(api_requests_total.clone()))?;
        registry.register(Box::new(api_request_duration.clone()))?;

        Ok(Self {
            registry,
            scrapes_total,
            scrape_errors_total,
            scrape_duration,
            resources_collected,
            resources_skipped,
            batch_requests_total,
            api_requests_total,
            api_request_duration,
        })
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Record the outcome of one collection pass.
    pub fn observe_scrape(&self, result: &Result<Scrape, CollectError>, elapsed: Duration) {
        self.scrapes_total.inc();
        self.scrape_duration.observe(elapsed.as_secs_f64());

        match result {
            Ok(scrape) => {
                self.resources_collected.set(scrape.resources as f64);
                self.resources_skipped.set(scrape.skipped as f64);
            }
            Err(e) => {
                self.scrape_errors_total.with_label_values(&[e.stage()]).inc();
            }
        }
    }

    /// Record one Azure API request.
    pub fn observe_request(&self, endpoint: &str, status: &str, duration: Duration) {
        self.api_requests_total
            .with_label_values(&[endpoint, status])
            .inc();
        self.api_request_duration
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    }
}
