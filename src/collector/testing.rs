//! Scripted in-memory Azure API used by pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, bail, Result};

use crate::azure::types::{AzureResource, RawBatchResponseItem};
use crate::azure::{AzureApi, ResourceFilter};
use crate::resource::{relative_resource_id, resource_type};

const METRICS_SUFFIX: &str = "/providers/microsoft.insights/metrics";

#[derive(Default)]
pub struct FakeAzure {
    listings: HashMap<ResourceFilter, Vec<AzureResource>>,
    api_versions: HashMap<String, String>,
    lookups: HashMap<String, (u16, serde_json::Value)>,
    metrics: HashMap<String, (u16, serde_json::Value)>,
    fail_token: bool,
    fail_batch_call: Option<usize>,
    batch_sizes: parking_lot::Mutex<Vec<usize>>,
    batch_urls: parking_lot::Mutex<Vec<String>>,
    listing_calls: AtomicUsize,
}

impl FakeAzure {
    pub fn resource(group: &str, resource_type: &str, name: &str) -> AzureResource {
        AzureResource {
            id: format!("/subscriptions/sub/resourceGroups/{group}/providers/{resource_type}/{name}"),
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            location: "westeurope".to_string(),
            ..Default::default()
        }
    }

    /// Metric values body with one metric and a two-point series.
    pub fn metric_body(name: &str, unit: &str, last: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "value": [{
                "name": { "value": name, "localizedValue": name },
                "unit": unit,
                "timeseries": [{
                    "data": [
                        { "timeStamp": "2024-01-01T00:00:00Z", "total": 0.0, "average": 0.0, "minimum": 0.0, "maximum": 0.0 },
                        last
                    ]
                }]
            }]
        })
    }

    pub fn with_listing(mut self, filter: ResourceFilter, resources: Vec<AzureResource>) -> Self {
        self.listings.insert(filter, resources);
        self
    }

    pub fn with_api_version(mut self, resource_type: &str, version: &str) -> Self {
        self.api_versions
            .insert(resource_type.to_ascii_lowercase(), version.to_string());
        self
    }

    /// Script the lookup answer for a relative resource ID.
    pub fn with_lookup(mut self, resource_id: &str, status: u16, body: serde_json::Value) -> Self {
        self.lookups.insert(resource_id.to_string(), (status, body));
        self
    }

    /// Script the metric values answer for a relative resource ID.
    pub fn with_metrics(mut self, resource_id: &str, status: u16, body: serde_json::Value) -> Self {
        self.metrics.insert(resource_id.to_string(), (status, body));
        self
    }

    pub fn failing_token(mut self) -> Self {
        self.fail_token = true;
        self
    }

    /// Fail the n-th batch call (1-based) with a transport error.
    pub fn failing_batch_call(mut self, call: usize) -> Self {
        self.fail_batch_call = Some(call);
        self
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    pub fn batch_urls(&self) -> Vec<String> {
        self.batch_urls.lock().clone()
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::Relaxed)
    }

    fn answer(&self, url: &str) -> RawBatchResponseItem {
        let path = url.split('?').next().unwrap_or_default();

        let (status, content) = if let Some(resource_path) = path.strip_suffix(METRICS_SUFFIX) {
            let id = relative_resource_id(resource_path);
            self.metrics.get(id).cloned().unwrap_or_else(|| {
                (
                    200,
                    Self::metric_body(
                        "Requests",
                        "Count",
                        serde_json::json!({ "total": 1.0, "average": 1.0, "minimum": 1.0, "maximum": 1.0 }),
                    ),
                )
            })
        } else {
            let id = relative_resource_id(path);
            self.lookups.get(id).cloned().unwrap_or_else(|| {
                let name = path.rsplit('/').next().unwrap_or_default();
                (
                    200,
                    serde_json::json!({
                        "id": path,
                        "name": name,
                        "type": resource_type(path).unwrap_or_default(),
                        "location": "westeurope",
                    }),
                )
            })
        };

        RawBatchResponseItem {
            http_status_code: status,
            content,
        }
    }
}

impl AzureApi for FakeAzure {
    async fn refresh_token(&self) -> Result<()> {
        if self.fail_token {
            bail!("token endpoint unavailable");
        }
        Ok(())
    }

    async fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<AzureResource>> {
        self.listing_calls.fetch_add(1, Ordering::Relaxed);
        self.listings
            .get(filter)
            .cloned()
            .ok_or_else(|| anyhow!("unexpected status 404 listing {filter}"))
    }

    async fn batch(&self, urls: &[String]) -> Result<Vec<RawBatchResponseItem>> {
        let call = {
            let mut sizes = self.batch_sizes.lock();
            sizes.push(urls.len());
            sizes.len()
        };

        if self.fail_batch_call == Some(call) {
            bail!("connection reset during batch call {call}");
        }

        self.batch_urls.lock().extend(urls.iter().cloned());
        Ok(urls.iter().map(|u| self.answer(u)).collect())
    }

    fn api_version_for(&self, resource_type: &str) -> Option<String> {
        self.api_versions
            .get(&resource_type.to_ascii_lowercase())
            .cloned()
    }
}
