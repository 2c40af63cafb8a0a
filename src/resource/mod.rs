use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::azure::types::AzureResource;
use crate::config::{Aggregation, MetricSelection};

const METRICS_API_VERSION: &str = "2018-01-01";

/// One monitored resource plus its metric query.
#[derive(Debug, Clone, Default)]
pub struct ResourceDescriptor {
    /// Resource ID relative to the subscription ("/resourceGroups/...").
    pub resource_id: String,
    /// Metric values query, relative to the Resource Manager endpoint.
    pub resource_url: String,
    pub metric_namespace: String,
    /// Comma-joined metric names.
    pub metric_names: String,
    pub aggregations: Vec<Aggregation>,
    /// Resource metadata; empty `id` until resolved.
    pub resource: AzureResource,
}

impl ResourceDescriptor {
    /// Build a descriptor whose metadata is still unresolved.
    pub fn new(
        subscription_id: &str,
        resource_id: &str,
        selection: &MetricSelection,
        window: &QueryWindow,
    ) -> Self {
        let resource_id = leading_slash(resource_id).to_string();
        let metric_names = selection.metric_names();
        let aggregations = selection.effective_aggregations();
        let resource_url = metric_url(
            subscription_id,
            &resource_id,
            &selection.metric_namespace,
            &metric_names,
            &aggregations,
            window,
        );

        Self {
            resource_id,
            resource_url,
            metric_namespace: selection.metric_namespace.clone(),
            metric_names,
            aggregations,
            resource: AzureResource::default(),
        }
    }

    /// Attach already-known metadata.
    pub fn with_resource(mut self, resource: AzureResource) -> Self {
        self.resource = resource;
        self
    }

    /// Whether metadata still has to be looked up.
    pub fn needs_metadata(&self) -> bool {
        self.resource.id.is_empty()
    }
}

/// Minute-aligned time range for metric queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QueryWindow {
    /// Window of the given width ending at the minute boundary before `now`.
    pub fn ending_at(now: DateTime<Utc>, width: Duration) -> Self {
        let end = now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now);
        let width = TimeDelta::from_std(width).unwrap_or_else(|_| TimeDelta::minutes(1));

        Self {
            start: end - width,
            end,
        }
    }

    /// ISO 8601 interval as Azure expects it in `timespan`.
    pub fn timespan(&self) -> String {
        format!(
            "{}/{}",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Prefix `/` if missing.
pub fn leading_slash(resource_id: &str) -> std::borrow::Cow<'_, str> {
    if resource_id.starts_with('/') {
        std::borrow::Cow::Borrowed(resource_id)
    } else {
        std::borrow::Cow::Owned(format!("/{resource_id}"))
    }
}

/// Strip a leading "/subscriptions/{id}" from a full resource ID.
pub fn relative_resource_id(id: &str) -> &str {
    let mut parts = id.splitn(4, '/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(""), Some(seg), Some(_), Some(rest)) if seg.eq_ignore_ascii_case("subscriptions") => {
            // `rest` lost its leading slash in the split.
            &id[id.len() - rest.len() - 1..]
        }
        _ => id,
    }
}

/// Metric values query for one resource. Pure string construction.
pub fn metric_url(
    subscription_id: &str,
    resource_id: &str,
    metric_namespace: &str,
    metric_names: &str,
    aggregations: &[Aggregation],
    window: &QueryWindow,
) -> String {
    let aggregation = aggregations
        .iter()
        .map(Aggregation::as_str)
        .collect::<Vec<_>>()
        .join(",");

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("aggregation", &aggregation);
    query.append_pair("api-version", METRICS_API_VERSION);
    query.append_pair("interval", "PT1M");
    query.append_pair("metricnames", metric_names);
    if !metric_namespace.is_empty() {
        query.append_pair("metricnamespace", metric_namespace);
    }
    query.append_pair("timespan", &window.timespan());

    format!(
        "/subscriptions/{}{}/providers/microsoft.insights/metrics?{}",
        subscription_id,
        leading_slash(resource_id),
        query.finish()
    )
}

/// Resource metadata lookup for one resource. Pure string construction.
pub fn lookup_url(resource_id: &str, api_version: &str, subscription_id: &str) -> String {
    format!(
        "/subscriptions/{}{}?api-version={}",
        subscription_id,
        leading_slash(resource_id),
        api_version
    )
}

/// Hierarchy segments of an ARM resource ID or URL.
///
/// `/subscriptions/S/resourceGroups/G/providers/NS/type/name[/subtype/subname]...`
#[derive(Debug, PartialEq, Eq)]
pub struct ResourcePath<'a> {
    pub resource_group: &'a str,
    pub namespace: &'a str,
    pub types: Vec<&'a str>,
    pub names: Vec<&'a str>,
}

impl<'a> ResourcePath<'a> {
    /// Parse the resource part of an ID or metrics URL. Query strings and a
    /// trailing `/providers/microsoft.insights/...` suffix are ignored.
    pub fn parse(id_or_url: &'a str) -> Option<Self> {
        let path = id_or_url.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let resource_group = segments
            .iter()
            .position(|s| s.eq_ignore_ascii_case("resourceGroups"))
            .and_then(|i| segments.get(i + 1))
            .copied()
            .unwrap_or_default();

        let providers = segments
            .iter()
            .position(|s| s.eq_ignore_ascii_case("providers"))?;
        let namespace = *segments.get(providers + 1)?;

        let mut types = Vec::new();
        let mut names = Vec::new();
        let mut rest = segments.get(providers + 2..).unwrap_or_default().iter();
        while let Some(resource_type) = rest.next() {
            if resource_type.eq_ignore_ascii_case("providers") {
                break;
            }
            let Some(name) = rest.next() else { break };
            types.push(*resource_type);
            names.push(*name);
        }

        if types.is_empty() {
            return None;
        }

        Some(Self {
            resource_group,
            namespace,
            types,
            names,
        })
    }

    /// Full type, e.g. "Microsoft.Sql/servers/databases".
    pub fn resource_type(&self) -> String {
        let mut out = self.namespace.to_string();
        for t in &self.types {
            out.push('/');
            out.push_str(t);
        }
        out
    }

    /// Labels attached to every metric of this resource.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("resource_group".to_string(), self.resource_group.to_string());
        if let Some(name) = self.names.first() {
            labels.insert("resource_name".to_string(), name.to_string());
        }
        if let Some(sub) = self.names.get(1) {
            labels.insert("sub_resource_name".to_string(), sub.to_string());
        }
        labels
    }
}

/// Resource type derived from a resource ID or URL.
pub fn resource_type(id_or_url: &str) -> Option<String> {
    ResourcePath::parse(id_or_url).map(|p| p.resource_type())
}

/// Labels derived from the resource URL hierarchy.
pub fn resource_labels(resource_url: &str) -> BTreeMap<String, String> {
    ResourcePath::parse(resource_url)
        .map(|p| p.labels())
        .unwrap_or_default()
}

/// Full label set for the resource-info series.
pub fn info_labels(descriptor: &ResourceDescriptor) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    for (key, value) in &descriptor.resource.tags {
        let key = sanitize_label_name(&format!("tag_{}", key.to_lowercase()));
        labels.insert(key, value.clone());
    }

    labels.extend(resource_labels(&descriptor.resource_url));
    labels.insert("resource_type".to_string(), descriptor.resource.resource_type.clone());
    labels.insert("azure_location".to_string(), descriptor.resource.location.clone());
    labels.insert(
        "azure_subscription".to_string(),
        descriptor.resource.subscription.clone(),
    );
    labels.insert("managed_by".to_string(), descriptor.resource.managed_by.clone());

    labels
}

/// Replace characters outside `[a-zA-Z0-9_]` with `_`.
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
