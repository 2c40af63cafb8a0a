use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::batch::BatchItem;
use crate::azure::types::{MetricValue, MetricValueResponse};
use crate::resource::{info_labels, resource_labels, ResourceDescriptor};

pub const RESOURCE_INFO: &str = "azure_resource_info";
const RESOURCE_INFO_HELP: &str = "Azure information available for resource";

static INVALID_METRIC_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-zA-Z0-9_:]").expect("valid regex"));

/// A single gauge sample produced during one scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: String,
    pub help: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Prometheus-safe name for a metric, before any aggregation suffix.
pub fn metric_base_name(display_name: &str, unit: &str, namespace: &str) -> String {
    let mut name = format!("{}_{}", display_name.replace(' ', "_"), unit)
        .to_lowercase()
        .replace('/', "_per_");

    if !namespace.is_empty() {
        name = format!("{namespace}_{name}").to_lowercase();
    }

    let name = INVALID_METRIC_CHARS.replace_all(&name, "_");
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{name}")
    } else {
        name.into_owned()
    }
}

/// Normalised name for well-known Azure metrics; anything else maps to itself.
pub fn alias_for(name: &str) -> &str {
    match name {
        "cpu_percent_percent_average" => "node_cpu_average",
        "network_bytes_egress_bytes_average" => "node_network_transmit_bytes_total",
        "network_bytes_ingress_bytes_average" => "node_network_receive_bytes_total",
        "storage_limit_bytes_average" => "node_filesystem_size_bytes",
        "storage_used_bytes_average" => "azure_storage_used_bytes_average",
        "storage_percent_percent_average" => "azure_storage_percent_average",
        "memory_percent_percent_average" => "azure_memory_percent_average",
        other => other,
    }
}

/// Turns metric responses into observations for one scrape.
///
/// Tracks which resources already produced their info series so each
/// resource ID is published once however many descriptors point at it.
#[derive(Debug, Default)]
pub struct Extractor {
    published: HashSet<String>,
    observations: Vec<Observation>,
    skipped: usize,
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resources skipped because of a failed or empty response.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn extract(&mut self, descriptor: &ResourceDescriptor, item: &BatchItem<MetricValueResponse>) {
        if !item.is_success() {
            let message = item
                .content
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or_default();
            warn!(
                status = item.status,
                resource = %descriptor.resource_id,
                error = message,
                "metric query failed, skipping resource"
            );
            self.skipped += 1;
            return;
        }

        let Some(first) = item.content.value.first() else {
            warn!(
                metrics = %descriptor.metric_names,
                resource = %descriptor.resource_id,
                "metrics not found"
            );
            self.skipped += 1;
            return;
        };

        if first.timeseries.first().map_or(true, |s| s.data.is_empty()) {
            warn!(
                metrics = %descriptor.metric_names,
                resource = %descriptor.resource_id,
                "no metric data returned"
            );
            self.skipped += 1;
            return;
        }

        let labels = resource_labels(&descriptor.resource_url);
        for value in &item.content.value {
            self.push_values(descriptor, value, &labels);
        }

        if self.published.insert(descriptor.resource.id.clone()) {
            self.observations.push(Observation {
                name: RESOURCE_INFO.to_string(),
                help: RESOURCE_INFO_HELP.to_string(),
                labels: info_labels(descriptor),
                value: 1.0,
            });
        }
    }

    fn push_values(
        &mut self,
        descriptor: &ResourceDescriptor,
        value: &MetricValue,
        labels: &BTreeMap<String, String>,
    ) {
        let Some(latest) = value.timeseries.first().and_then(|s| s.data.last()) else {
            debug!(metric = %value.name.value, "metric has no data points");
            return;
        };

        let base = metric_base_name(&value.name.value, &value.unit, &descriptor.metric_namespace);

        for aggregation in &descriptor.aggregations {
            let Some(v) = latest.value(*aggregation) else {
                debug!(metric = %base, aggregation = aggregation.as_str(), "aggregation missing from data point");
                continue;
            };

            let name = format!("{base}_{}", aggregation.suffix());
            let alias = alias_for(&name).to_string();
            self.observations.push(Observation {
                name: alias.clone(),
                help: alias,
                labels: labels.clone(),
                value: v,
            });
        }
    }

    pub fn into_observations(self) -> Vec<Observation> {
        self.observations
    }
}
