use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::Aggregation;

/// Azure Resource Manager metadata for one resource.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureResource {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub resource_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub location: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub managed_by: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: BTreeMap<String, String>,
    /// Not part of the API payload; stamped from the configured credentials.
    #[serde(skip)]
    pub subscription: String,
}

/// Paged resource listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResourceListResponse {
    #[serde(default)]
    pub value: Vec<AzureResource>,
    #[serde(default)]
    pub next_link: Option<String>,
}

/// Error body returned by Azure APIs.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Response of a metric values query.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MetricValueResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub value: Vec<MetricValue>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

/// One metric within a metric values response.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MetricValue {
    #[serde(default)]
    pub name: LocalizableString,
    #[serde(default)]
    pub unit: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizableString {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub localized_value: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct TimeSeries {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<DataPoint>,
}

/// A single sample interval. Azure omits aggregations without samples.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    #[serde(default)]
    pub time_stamp: String,
    pub total: Option<f64>,
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

impl DataPoint {
    /// Value of the given aggregation, if Azure reported one.
    pub fn value(&self, aggregation: Aggregation) -> Option<f64> {
        match aggregation {
            Aggregation::Total => self.total,
            Aggregation::Average => self.average,
            Aggregation::Minimum => self.minimum,
            Aggregation::Maximum => self.maximum,
        }
    }
}

// --- Batch API ---

#[derive(Debug, Serialize)]
pub(crate) struct BatchRequest<'a> {
    pub requests: Vec<BatchRequestItem<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchRequestItem<'a> {
    pub http_method: &'static str,
    pub relative_url: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchResponse {
    #[serde(default)]
    pub responses: Vec<RawBatchResponseItem>,
}

/// One correlated sub-response of a batch call, body still undecoded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBatchResponseItem {
    pub http_status_code: u16,
    #[serde(default)]
    pub content: serde_json::Value,
}

// --- Token ---

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub expires_on: NumberOrString,
}

/// Azure AD v1 returns `expires_on` as a string; some proxies send a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum NumberOrString {
    Number(i64),
    String(String),
}

impl NumberOrString {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
        }
    }
}

// --- Providers / API versions ---

#[derive(Debug, Deserialize)]
pub(crate) struct ProvidersResponse {
    #[serde(default)]
    pub value: Vec<Provider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Provider {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub resource_types: Vec<ProviderResourceType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProviderResourceType {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub api_versions: Vec<String>,
}

/// Resource type to API version lookup table.
#[derive(Debug, Default, Clone)]
pub struct ApiVersions {
    versions: HashMap<String, String>,
}

impl ApiVersions {
    pub(crate) fn from_providers(providers: ProvidersResponse) -> Self {
        let mut table = Self::default();
        for provider in providers.value {
            for rt in provider.resource_types {
                if let Some(version) = rt.api_versions.first() {
                    table.insert(&format!("{}/{}", provider.namespace, rt.resource_type), version);
                }
            }
        }
        table
    }

    /// Register a version for a "Namespace/type[/subtype]" key.
    pub fn insert(&mut self, resource_type: &str, version: &str) {
        self.versions
            .insert(resource_type.to_ascii_lowercase(), version.to_string());
    }

    /// Latest API version for a resource type, matched case-insensitively.
    pub fn find_by(&self, resource_type: &str) -> Option<&str> {
        self.versions
            .get(&resource_type.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

// --- Metric definitions / namespaces (listing modes) ---

#[derive(Debug, Deserialize)]
pub(crate) struct MetricDefinitionsResponse {
    #[serde(default)]
    pub value: Vec<MetricDefinition>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MetricDefinition {
    #[serde(default)]
    pub name: LocalizableString,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MetricNamespacesResponse {
    #[serde(default)]
    pub value: Vec<MetricNamespace>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MetricNamespace {
    #[serde(default)]
    pub properties: MetricNamespaceProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetricNamespaceProperties {
    #[serde(default)]
    pub metric_namespace_name: String,
}

/// Treat an explicit JSON `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
