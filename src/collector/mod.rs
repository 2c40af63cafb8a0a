//! Scrape-time collection pipeline.
//!
//! One [`MetricsCollector::collect`] call runs the whole pass: refresh the
//! token, resolve configured resources, complete missing metadata, fetch
//! metric values in batches and turn them into observations. Any stage
//! failure aborts the pass with a [`CollectError`]; per-resource problems in
//! the metric responses are logged and skipped.

pub mod batch;
pub mod extract;
pub mod metadata;
pub mod resolver;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::azure::types::MetricValueResponse;
use crate::azure::AzureApi;
use crate::config::Config;
use crate::resource::QueryWindow;
use batch::{execute_batch, BatchItem, BatchKind, DEFAULT_BATCH_SIZE};
use extract::{Extractor, Observation, RESOURCE_INFO};
use metadata::complete_metadata;
use resolver::Resolver;

const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_QUERY_WINDOW: Duration = Duration::from_secs(60);

/// Callback for batch call outcomes: (kind, status).
pub type BatchCallback = Box<dyn Fn(BatchKind, &str) + Send + Sync>;

/// Errors that abort a whole collection pass.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("refreshing access token")]
    TokenRefresh(#[source] anyhow::Error),

    #[error("listing resources of resource group {group}")]
    ResourceGroupListing {
        group: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("listing resources tagged {name}={value}")]
    TagListing {
        name: String,
        value: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot determine resource type of {resource}")]
    UnknownResourceType { resource: String },

    #[error("no API version known for resource type {resource_type}")]
    UnknownApiVersion { resource_type: String },

    #[error("{kind} batch call {chunk} of {chunks} failed")]
    Batch {
        kind: BatchKind,
        chunk: usize,
        chunks: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("looking up resource {resource} returned status {status}")]
    ResourceLookup { resource: String, status: u16 },

    #[error("collection did not finish within {0:?}")]
    Timeout(Duration),
}

impl CollectError {
    /// Short label naming the failed stage.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::TokenRefresh(_) => "token",
            Self::ResourceGroupListing { .. } => "resource_group_listing",
            Self::TagListing { .. } => "tag_listing",
            Self::UnknownResourceType { .. }
            | Self::UnknownApiVersion { .. }
            | Self::ResourceLookup { .. } => "metadata",
            Self::Batch {
                kind: BatchKind::Lookup,
                ..
            } => "lookup_batch",
            Self::Batch {
                kind: BatchKind::Metrics,
                ..
            } => "metrics_batch",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Static shape of a metric family the collector may produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: &'static str,
    pub help: &'static str,
}

/// Result of one successful collection pass.
#[derive(Debug, Default)]
pub struct Scrape {
    pub observations: Vec<Observation>,
    /// Resources whose metrics were queried.
    pub resources: usize,
    /// Resources skipped because of failed or empty metric responses.
    pub skipped: usize,
    /// Descriptors that needed a metadata lookup.
    pub completed: usize,
    pub listing_calls: usize,
    pub duration: Duration,
}

/// Something that produces observations on demand.
pub trait MetricsCollector: Send + Sync {
    /// Metric families known ahead of collection. Names derived from
    /// Azure responses are only known after a pass.
    fn describe(&self) -> Vec<MetricDesc>;

    /// Run one full collection pass.
    fn collect(&self) -> impl std::future::Future<Output = Result<Scrape, CollectError>> + Send;
}

/// Collector backed by the Azure Resource Manager APIs.
pub struct AzureCollector<C> {
    api: Arc<C>,
    config: Arc<Config>,
    on_batch: Option<BatchCallback>,
}

impl<C: AzureApi> AzureCollector<C> {
    pub fn new(api: Arc<C>, config: Arc<Config>) -> Self {
        Self {
            api,
            config,
            on_batch: None,
        }
    }

    /// Set a callback invoked once per batch call with its outcome.
    pub fn with_batch_callback(mut self, cb: BatchCallback) -> Self {
        self.on_batch = Some(cb);
        self
    }

    fn batch_size(&self) -> usize {
        match self.config.batch_size {
            0 => DEFAULT_BATCH_SIZE,
            n => n,
        }
    }

    fn scrape_timeout(&self) -> Duration {
        if self.config.scrape_timeout.is_zero() {
            DEFAULT_SCRAPE_TIMEOUT
        } else {
            self.config.scrape_timeout
        }
    }

    fn query_window(&self, now: DateTime<Utc>) -> QueryWindow {
        let width = if self.config.query_window.is_zero() {
            DEFAULT_QUERY_WINDOW
        } else {
            self.config.query_window
        };
        QueryWindow::ending_at(now, width)
    }

    /// Run a collection pass with metric windows ending at `now`.
    pub async fn collect_at(&self, now: DateTime<Utc>) -> Result<Scrape, CollectError> {
        let start = Instant::now();
        let api = self.api.as_ref();
        let config = self.config.as_ref();
        let subscription_id = &config.credentials.subscription_id;
        let batch_size = self.batch_size();

        api.refresh_token().await.map_err(CollectError::TokenRefresh)?;

        let mut resolver = Resolver::new(api, config, self.query_window(now));
        let mut incomplete = resolver.targets();
        incomplete.extend(resolver.tagged().await?);
        let groups = resolver.resource_groups().await?;

        let completed = complete_metadata(api, &mut incomplete, subscription_id, batch_size)
            .await
            .inspect_err(|e| self.record_failure(e))?;
        self.record_success(BatchKind::Lookup, completed);

        let mut descriptors = groups;
        descriptors.extend(incomplete);

        let urls: Vec<String> = descriptors.iter().map(|d| d.resource_url.clone()).collect();
        let items: Vec<BatchItem<MetricValueResponse>> =
            execute_batch(api, &urls, batch_size, BatchKind::Metrics)
                .await
                .inspect_err(|e| self.record_failure(e))?;
        self.record_success(BatchKind::Metrics, urls.len());

        let mut extractor = Extractor::new();
        for (descriptor, item) in descriptors.iter().zip(&items) {
            extractor.extract(descriptor, item);
        }

        let scrape = Scrape {
            resources: descriptors.len(),
            skipped: extractor.skipped(),
            completed,
            listing_calls: resolver.listing_calls(),
            observations: extractor.into_observations(),
            duration: start.elapsed(),
        };

        debug!(
            resources = scrape.resources,
            skipped = scrape.skipped,
            completed = scrape.completed,
            listing_calls = scrape.listing_calls,
            observations = scrape.observations.len(),
            duration_ms = scrape.duration.as_millis() as u64,
            "collection finished"
        );

        Ok(scrape)
    }

    fn record_success(&self, kind: BatchKind, requests: usize) {
        if let Some(ref cb) = self.on_batch {
            for _ in 0..requests.div_ceil(self.batch_size()) {
                cb(kind, "success");
            }
        }
    }

    /// Chunks before the failing one went through.
    fn record_failure(&self, err: &CollectError) {
        if let (Some(cb), CollectError::Batch { kind, chunk, .. }) = (&self.on_batch, err) {
            for _ in 1..*chunk {
                cb(*kind, "success");
            }
            cb(*kind, "error");
        }
    }
}

impl<C: AzureApi> MetricsCollector for AzureCollector<C> {
    fn describe(&self) -> Vec<MetricDesc> {
        vec![
            MetricDesc {
                name: RESOURCE_INFO,
                help: "Azure information available for resource",
            },
            MetricDesc {
                name: crate::export::ERROR_METRIC,
                help: crate::export::ERROR_HELP,
            },
        ]
    }

    async fn collect(&self) -> Result<Scrape, CollectError> {
        let timeout = self.scrape_timeout();
        match tokio::time::timeout(timeout, self.collect_at(Utc::now())).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::azure::ResourceFilter;
    use crate::config::{Aggregation, Credentials, Metric, MetricSelection, ResourceGroup, ResourceTag, Target};
    use crate::collector::testing::FakeAzure;

    const WEB_APP: &str = "/resourceGroups/rg/providers/Microsoft.Web/sites/app";

    fn selection(aggregations: Vec<Aggregation>) -> MetricSelection {
        MetricSelection {
            metrics: vec![Metric {
                name: "Requests".to_string(),
            }],
            aggregations,
            ..Default::default()
        }
    }

    fn config() -> Config {
        Config {
            credentials: Credentials {
                subscription_id: "sub".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30)
            .single()
            .expect("valid time")
    }

    fn collector(api: FakeAzure, config: Config) -> (Arc<FakeAzure>, AzureCollector<FakeAzure>) {
        let api = Arc::new(api);
        (api.clone(), AzureCollector::new(api, Arc::new(config)))
    }

    fn count(scrape: &Scrape, name: &str) -> usize {
        scrape.observations.iter().filter(|o| o.name == name).count()
    }

    fn group_of(n: usize) -> (ResourceFilter, Vec<crate::azure::types::AzureResource>) {
        (
            ResourceFilter::ResourceGroup {
                group: "rg".to_string(),
            },
            (0..n)
                .map(|i| FakeAzure::resource("rg", "Microsoft.Web/sites", &format!("app{i:02}")))
                .collect(),
        )
    }

    fn group_entry() -> ResourceGroup {
        ResourceGroup {
            resource_group: "rg".to_string(),
            resource_types: vec!["Microsoft.Web/sites".to_string()],
            resource_name_include_re: Vec::new(),
            resource_name_exclude_re: Vec::new(),
            selection: selection(vec![Aggregation::Total]),
            name_filter: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_single_target_two_aggregations() {
        let mut cfg = config();
        cfg.targets.push(Target {
            resource: WEB_APP.to_string(),
            selection: selection(vec![Aggregation::Total, Aggregation::Average]),
        });

        let (api, collector) = collector(
            FakeAzure::default().with_api_version("Microsoft.Web/sites", "2022-03-01"),
            cfg,
        );
        let scrape = collector.collect_at(now()).await.expect("scrape");

        assert_eq!(scrape.observations.len(), 3);
        assert_eq!(count(&scrape, "requests_count_total"), 1);
        assert_eq!(count(&scrape, "requests_count_average"), 1);
        assert_eq!(count(&scrape, RESOURCE_INFO), 1);
        assert_eq!(scrape.completed, 1);
        // One lookup call, one metrics call.
        assert_eq!(api.batch_sizes(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_group_of_25_is_fetched_in_two_calls() {
        let mut cfg = config();
        cfg.resource_groups.push(group_entry());
        let (filter, resources) = group_of(25);

        let (api, collector) = collector(FakeAzure::default().with_listing(filter, resources), cfg);
        let scrape = collector.collect_at(now()).await.expect("scrape");

        assert_eq!(api.batch_sizes(), vec![20, 5]);
        assert_eq!(scrape.resources, 25);
        assert_eq!(count(&scrape, RESOURCE_INFO), 25);

        let names: Vec<_> = scrape
            .observations
            .iter()
            .filter(|o| o.name == RESOURCE_INFO)
            .filter_map(|o| o.labels.get("resource_name").cloned())
            .collect();
        let expected: Vec<_> = (0..25).map(|i| format!("app{i:02}")).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_failed_second_chunk_fails_scrape() {
        let mut cfg = config();
        cfg.resource_groups.push(group_entry());
        let (filter, resources) = group_of(50);

        let (api, collector) = collector(
            FakeAzure::default()
                .with_listing(filter, resources)
                .failing_batch_call(2),
            cfg,
        );
        let err = collector.collect_at(now()).await.unwrap_err();

        assert!(matches!(
            err,
            CollectError::Batch {
                kind: BatchKind::Metrics,
                chunk: 2,
                chunks: 3,
                ..
            }
        ));
        assert_eq!(err.stage(), "metrics_batch");
        assert_eq!(api.batch_sizes(), vec![20, 20]);
    }

    #[tokio::test]
    async fn test_failed_resource_does_not_affect_siblings() {
        let mut cfg = config();
        cfg.resource_groups.push(group_entry());
        let (filter, resources) = group_of(3);

        let (_, collector) = collector(
            FakeAzure::default()
                .with_listing(filter, resources)
                .with_metrics(
                    "/resourceGroups/rg/providers/Microsoft.Web/sites/app01",
                    429,
                    json!({ "error": { "code": "TooManyRequests", "message": "throttled" } }),
                ),
            cfg,
        );
        let scrape = collector.collect_at(now()).await.expect("scrape");

        assert_eq!(scrape.skipped, 1);
        assert_eq!(count(&scrape, "requests_count_total"), 2);
        assert_eq!(count(&scrape, RESOURCE_INFO), 2);
        assert!(scrape.observations.iter().all(|o| {
            o.labels.get("resource_name").map(String::as_str) != Some("app01")
        }));
    }

    #[tokio::test]
    async fn test_null_error_body_skips_only_that_resource() {
        let mut cfg = config();
        cfg.resource_groups.push(group_entry());
        let (filter, resources) = group_of(2);

        let (_, collector) = collector(
            FakeAzure::default()
                .with_listing(filter, resources)
                .with_metrics(
                    "/resourceGroups/rg/providers/Microsoft.Web/sites/app01",
                    503,
                    serde_json::Value::Null,
                ),
            cfg,
        );
        let scrape = collector.collect_at(now()).await.expect("scrape");

        assert_eq!(scrape.skipped, 1);
        let published: Vec<_> = scrape
            .observations
            .iter()
            .filter(|o| o.name == "requests_count_total")
            .filter_map(|o| o.labels.get("resource_name").map(String::as_str))
            .collect();
        assert_eq!(published, vec!["app00"]);
    }

    #[tokio::test]
    async fn test_token_failure_stops_before_any_call() {
        let mut cfg = config();
        cfg.resource_groups.push(group_entry());
        let (filter, resources) = group_of(1);

        let (api, collector) = collector(
            FakeAzure::default()
                .with_listing(filter, resources)
                .failing_token(),
            cfg,
        );
        let err = collector.collect_at(now()).await.unwrap_err();

        assert!(matches!(err, CollectError::TokenRefresh(_)));
        assert_eq!(api.listing_calls(), 0);
        assert!(api.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_tag_and_group_resources_merge_groups_first() {
        let mut cfg = config();
        cfg.resource_groups.push(group_entry());
        cfg.resource_tags.push(ResourceTag {
            resource_tag_name: "env".to_string(),
            resource_tag_value: "prod".to_string(),
            resource_types: Vec::new(),
            selection: selection(vec![Aggregation::Maximum]),
        });
        let (filter, resources) = group_of(1);

        let (api, collector) = collector(
            FakeAzure::default()
                .with_listing(filter, resources)
                .with_listing(
                    ResourceFilter::Tag {
                        name: "env".to_string(),
                        value: "prod".to_string(),
                    },
                    vec![FakeAzure::resource("other", "Microsoft.Sql/servers", "db")],
                )
                .with_api_version("Microsoft.Sql/servers", "2021-02-01"),
            cfg,
        );
        let scrape = collector.collect_at(now()).await.expect("scrape");

        assert_eq!(scrape.listing_calls, 2);
        assert_eq!(scrape.completed, 1);
        let urls = api.batch_urls();
        // Lookup for the tagged server, then metrics for the group resource
        // followed by the tagged one.
        assert_eq!(urls.len(), 3);
        assert!(urls[0].ends_with("/servers/db?api-version=2021-02-01"));
        assert!(urls[1].contains("/sites/app00/providers/microsoft.insights/metrics?"));
        assert!(urls[2].contains("/servers/db/providers/microsoft.insights/metrics?"));
        assert_eq!(count(&scrape, "requests_count_max"), 1);
    }

    #[tokio::test]
    async fn test_unknown_api_version_fails_scrape() {
        let mut cfg = config();
        cfg.targets.push(Target {
            resource: WEB_APP.to_string(),
            selection: selection(vec![Aggregation::Total]),
        });

        let (api, collector) = collector(FakeAzure::default(), cfg);
        let err = collector.collect_at(now()).await.unwrap_err();

        assert_eq!(err.stage(), "metadata");
        assert!(api.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_batch_callback_counts_calls() {
        let mut cfg = config();
        cfg.resource_groups.push(group_entry());
        let (filter, resources) = group_of(50);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let api = Arc::new(
            FakeAzure::default()
                .with_listing(filter, resources)
                .failing_batch_call(3),
        );
        let collector = AzureCollector::new(api, Arc::new(cfg)).with_batch_callback(Box::new(
            move |kind, status| sink.lock().push((kind, status.to_string())),
        ));

        collector.collect_at(now()).await.unwrap_err();

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (BatchKind::Metrics, "success".to_string()),
                (BatchKind::Metrics, "success".to_string()),
                (BatchKind::Metrics, "error".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_config_produces_nothing() {
        let (api, collector) = collector(FakeAzure::default(), config());
        let scrape = collector.collect().await.expect("scrape");

        assert!(scrape.observations.is_empty());
        assert!(api.batch_sizes().is_empty());
    }

    #[test]
    fn test_describe() {
        let (_, collector) = collector(FakeAzure::default(), config());
        let names: Vec<_> = collector.describe().iter().map(|d| d.name).collect();
        assert_eq!(names, vec![RESOURCE_INFO, "azure_error"]);
    }
}
