pub mod token;
pub mod types;

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::Config;
use token::TokenSource;
use types::{
    ApiVersions, AzureResource, BatchRequest, BatchRequestItem, BatchResponse,
    MetricDefinitionsResponse, MetricNamespacesResponse, ProvidersResponse, RawBatchResponseItem,
    ResourceListResponse,
};

const RESOURCES_API_VERSION: &str = "2017-05-10";
const BATCH_API_VERSION: &str = "2015-11-01";
const METRIC_DEFINITIONS_API_VERSION: &str = "2018-01-01";
const METRIC_NAMESPACES_API_VERSION: &str = "2017-12-01-preview";

/// Callback type for recording API request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Listing filter understood by the resource-listing primitive.
///
/// Doubles as the per-scrape cache key, so two configuration entries that
/// ask for the same listing share one API call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceFilter {
    ResourceGroup { group: String },
    Tag { name: String, value: String },
}

impl std::fmt::Display for ResourceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceGroup { group } => write!(f, "resource group {group}"),
            Self::Tag { name, value } => write!(f, "tag {name}={value}"),
        }
    }
}

/// Azure API primitives the collection pipeline depends on.
pub trait AzureApi: Send + Sync {
    /// Make sure a valid access token is available.
    fn refresh_token(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// List every resource matching a resource-group or tag filter.
    fn list_resources(
        &self,
        filter: &ResourceFilter,
    ) -> impl std::future::Future<Output = Result<Vec<AzureResource>>> + Send;

    /// Issue one batch call. Response `i` answers request `i`.
    fn batch(
        &self,
        urls: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<RawBatchResponseItem>>> + Send;

    /// API version to use when reading a resource of the given type.
    fn api_version_for(&self, resource_type: &str) -> Option<String>;
}

/// HTTP-based Azure Resource Manager client.
pub struct AzureClient {
    http: reqwest::Client,
    base_url: String,
    subscription_id: String,
    token: TokenSource,
    api_versions: parking_lot::RwLock<ApiVersions>,
    metrics: Option<MetricsCallback>,
}

impl AzureClient {
    /// Create a new client from configuration. No requests are made.
    pub fn new(cfg: &Config) -> Result<Self> {
        let timeout = if cfg.request_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.request_timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let creds = &cfg.credentials;
        let token = TokenSource::new(
            http.clone(),
            &cfg.active_directory_authority_url,
            &creds.tenant_id,
            &creds.client_id,
            &creds.client_secret,
            &cfg.resource_manager_url,
        );

        Ok(Self {
            http,
            base_url: cfg.resource_manager_url.trim_end_matches('/').to_string(),
            subscription_id: creds.subscription_id.clone(),
            token,
            api_versions: parking_lot::RwLock::new(ApiVersions::default()),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    fn url_for(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}{}", self.base_url, path_or_url)
        }
    }

    /// Perform an authenticated GET and deserialize the JSON response.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        path_or_url: &str,
    ) -> Result<T> {
        let bearer = self.token.bearer().await?;
        let start = Instant::now();
        let url = self.url_for(path_or_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(bearer)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {endpoint}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!("unexpected status {status} from {endpoint}: {body}");
        }

        let result: T = response
            .json()
            .await
            .with_context(|| format!("decoding response from {endpoint}"))?;

        self.record_request(endpoint, "success", start.elapsed());

        Ok(result)
    }

    /// Load the resource type to API version table. Startup-fatal on error.
    pub async fn load_api_versions(&self) -> Result<usize> {
        let path = format!(
            "/subscriptions/{}/providers?api-version={RESOURCES_API_VERSION}",
            self.subscription_id
        );

        let providers: ProvidersResponse = self
            .get_json("providers", &path)
            .await
            .context("listing resource providers")?;

        let table = ApiVersions::from_providers(providers);
        let count = table.len();
        *self.api_versions.write() = table;

        Ok(count)
    }

    /// Names of the metrics available for a resource.
    pub async fn metric_definitions(&self, resource_id: &str) -> Result<Vec<String>> {
        let path = format!(
            "/subscriptions/{}{}/providers/microsoft.insights/metricDefinitions?api-version={METRIC_DEFINITIONS_API_VERSION}",
            self.subscription_id,
            crate::resource::leading_slash(resource_id),
        );

        let resp: MetricDefinitionsResponse = self
            .get_json("metric_definitions", &path)
            .await
            .with_context(|| format!("fetching metric definitions for {resource_id}"))?;

        Ok(resp.value.into_iter().map(|d| d.name.value).collect())
    }

    /// Names of the metric namespaces available for a resource.
    pub async fn metric_namespaces(&self, resource_id: &str) -> Result<Vec<String>> {
        let path = format!(
            "/subscriptions/{}{}/providers/microsoft.insights/metricNamespaces?api-version={METRIC_NAMESPACES_API_VERSION}",
            self.subscription_id,
            crate::resource::leading_slash(resource_id),
        );

        let resp: MetricNamespacesResponse = self
            .get_json("metric_namespaces", &path)
            .await
            .with_context(|| format!("fetching metric namespaces for {resource_id}"))?;

        Ok(resp
            .value
            .into_iter()
            .map(|n| n.properties.metric_namespace_name)
            .collect())
    }

    fn listing_path(&self, filter: &ResourceFilter) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("api-version", RESOURCES_API_VERSION);

        match filter {
            ResourceFilter::ResourceGroup { group } => format!(
                "/subscriptions/{}/resourceGroups/{}/resources?{}",
                self.subscription_id,
                group,
                query.finish()
            ),
            ResourceFilter::Tag { name, value } => {
                let expr = if value.is_empty() {
                    format!("tagName eq '{name}'")
                } else {
                    format!("tagName eq '{name}' and tagValue eq '{value}'")
                };
                query.append_pair("$filter", &expr);
                format!(
                    "/subscriptions/{}/resources?{}",
                    self.subscription_id,
                    query.finish()
                )
            }
        }
    }
}

impl AzureApi for AzureClient {
    async fn refresh_token(&self) -> Result<()> {
        self.token.bearer().await.map(drop)
    }

    async fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<AzureResource>> {
        debug!(%filter, "listing resources");

        let mut resources = Vec::new();
        let mut next = Some(self.listing_path(filter));

        while let Some(page_url) = next.take() {
            let page: ResourceListResponse = self
                .get_json("resources", &page_url)
                .await
                .with_context(|| format!("listing resources for {filter}"))?;

            resources.extend(page.value);
            next = page.next_link.filter(|link| !link.is_empty());
        }

        Ok(resources)
    }

    async fn batch(&self, urls: &[String]) -> Result<Vec<RawBatchResponseItem>> {
        let bearer = self.token.bearer().await?;
        let start = Instant::now();
        let url = format!("{}/batch?api-version={BATCH_API_VERSION}", self.base_url);

        let body = BatchRequest {
            requests: urls
                .iter()
                .map(|u| BatchRequestItem {
                    http_method: "GET",
                    relative_url: u,
                })
                .collect(),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
            .context("sending batch request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            self.record_request("batch", "error", start.elapsed());
            bail!("unexpected status {status} from batch endpoint: {text}");
        }

        let batch: BatchResponse = response
            .json()
            .await
            .context("decoding batch response")?;

        self.record_request("batch", "success", start.elapsed());

        if batch.responses.len() != urls.len() {
            bail!(
                "batch returned {} responses for {} requests",
                batch.responses.len(),
                urls.len()
            );
        }

        Ok(batch.responses)
    }

    fn api_version_for(&self, resource_type: &str) -> Option<String> {
        self.api_versions
            .read()
            .find_by(resource_type)
            .map(str::to_string)
    }
}
