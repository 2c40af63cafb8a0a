use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Top-level configuration for the exporter.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service principal used for every Azure API call.
    pub credentials: Credentials,

    /// Azure AD authority. Default: "https://login.microsoftonline.com/".
    #[serde(default = "default_authority_url")]
    pub active_directory_authority_url: String,

    /// Azure Resource Manager endpoint. Default: "https://management.azure.com/".
    #[serde(default = "default_resource_manager_url")]
    pub resource_manager_url: String,

    /// Explicitly named resources.
    #[serde(default)]
    pub targets: Vec<Target>,

    /// Resources discovered by listing a resource group.
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroup>,

    /// Resources discovered by tag name and value.
    #[serde(default)]
    pub resource_tags: Vec<ResourceTag>,

    /// HTTP listen address. Default: ":9276".
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Sub-requests per batch call. Default: 20.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Deadline for one full collection pass. Default: 30s.
    #[serde(default = "default_scrape_timeout", with = "humantime_serde")]
    pub scrape_timeout: Duration,

    /// Per-request HTTP timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Width of the metric query window ending at scrape time. Default: 1m.
    #[serde(default = "default_query_window", with = "humantime_serde")]
    pub query_window: Duration,
}

/// Service principal credentials.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub tenant_id: String,
}

/// Statistical reduction requested from Azure Monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Aggregation {
    Total,
    Average,
    Minimum,
    Maximum,
}

impl Aggregation {
    /// All aggregations in the order Azure documents them.
    pub const ALL: [Aggregation; 4] = [
        Aggregation::Total,
        Aggregation::Average,
        Aggregation::Minimum,
        Aggregation::Maximum,
    ];

    /// Name as used in the `aggregation` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "Total",
            Self::Average => "Average",
            Self::Minimum => "Minimum",
            Self::Maximum => "Maximum",
        }
    }

    /// Suffix appended to the exported metric name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Average => "average",
            Self::Minimum => "min",
            Self::Maximum => "max",
        }
    }
}

/// A single metric name to query.
#[derive(Debug, Clone, Deserialize)]
pub struct Metric {
    pub name: String,
}

/// Metric selection shared by every kind of configuration entry.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MetricSelection {
    /// Optional metric namespace, also used as an exported name prefix.
    #[serde(default)]
    pub metric_namespace: String,

    #[serde(default)]
    pub metrics: Vec<Metric>,

    /// Requested aggregations. Empty means all four.
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
}

impl MetricSelection {
    /// Comma-joined metric names, in configuration order.
    pub fn metric_names(&self) -> String {
        self.metrics
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Configured aggregations, deduplicated, defaulting to all of them.
    pub fn effective_aggregations(&self) -> Vec<Aggregation> {
        if self.aggregations.is_empty() {
            return Aggregation::ALL.to_vec();
        }

        let mut seen = HashSet::new();
        self.aggregations
            .iter()
            .copied()
            .filter(|a| seen.insert(*a))
            .collect()
    }

    fn validate(&self, entry: &str) -> Result<()> {
        if self.metrics.is_empty() {
            bail!("{entry}: at least one metric is required");
        }

        if let Some(metric) = self.metrics.iter().find(|m| m.name.trim().is_empty()) {
            bail!("{entry}: metric name {:?} is empty", metric.name);
        }

        Ok(())
    }
}

/// An explicitly configured resource.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    /// Resource ID relative to the subscription ("/resourceGroups/...").
    pub resource: String,

    #[serde(flatten)]
    pub selection: MetricSelection,
}

/// Resources listed from one resource group.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceGroup {
    pub resource_group: String,

    /// Resource types to keep, e.g. "Microsoft.Compute/virtualMachines".
    #[serde(default)]
    pub resource_types: Vec<String>,

    /// Keep only resources whose name matches one of these.
    #[serde(default)]
    pub resource_name_include_re: Vec<String>,

    /// Drop resources whose name matches one of these.
    #[serde(default)]
    pub resource_name_exclude_re: Vec<String>,

    #[serde(flatten)]
    pub selection: MetricSelection,

    #[serde(skip)]
    pub name_filter: NameFilter,
}

/// Resources selected by a tag name and value.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceTag {
    pub resource_tag_name: String,

    #[serde(default)]
    pub resource_tag_value: String,

    #[serde(default)]
    pub resource_types: Vec<String>,

    #[serde(flatten)]
    pub selection: MetricSelection,
}

/// Compiled resource-name include/exclude patterns.
#[derive(Debug, Default, Clone)]
pub struct NameFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NameFilter {
    /// Compile include and exclude patterns.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).with_context(|| format!("compiling regex {p:?}")))
                .collect()
        };

        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Whether a resource name passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(name)) {
            return false;
        }

        !self.exclude.iter().any(|re| re.is_match(name))
    }
}

// --- Default value functions ---

fn default_authority_url() -> String {
    "https://login.microsoftonline.com/".to_string()
}

fn default_resource_manager_url() -> String {
    "https://management.azure.com/".to_string()
}

fn default_listen_address() -> String {
    ":9276".to_string()
}

fn default_batch_size() -> usize {
    20
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_query_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            active_directory_authority_url: default_authority_url(),
            resource_manager_url: default_resource_manager_url(),
            targets: Vec::new(),
            resource_groups: Vec::new(),
            resource_tags: Vec::new(),
            listen_address: default_listen_address(),
            batch_size: default_batch_size(),
            scrape_timeout: default_scrape_timeout(),
            request_timeout: default_request_timeout(),
            query_window: default_query_window(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse, validate and compile configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;

        cfg.validate()?;
        cfg.compile_filters()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let creds = &self.credentials;
        if creds.subscription_id.is_empty() {
            bail!("credentials.subscription_id is required");
        }
        if creds.client_id.is_empty() {
            bail!("credentials.client_id is required");
        }
        if creds.client_secret.is_empty() {
            bail!("credentials.client_secret is required");
        }
        if creds.tenant_id.is_empty() {
            bail!("credentials.tenant_id is required");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }

        if self.scrape_timeout.is_zero() {
            bail!("scrape_timeout must be positive");
        }

        if self.query_window < Duration::from_secs(60) {
            bail!("query_window must be at least 1m");
        }

        for (i, target) in self.targets.iter().enumerate() {
            let entry = format!("targets[{i}]");
            if !target.resource.starts_with("/resourceGroups/") {
                bail!(
                    "{entry}: resource {:?} must start with /resourceGroups/",
                    target.resource
                );
            }
            target.selection.validate(&entry)?;
        }

        for (i, group) in self.resource_groups.iter().enumerate() {
            let entry = format!("resource_groups[{i}]");
            if group.resource_group.is_empty() {
                bail!("{entry}: resource_group is required");
            }
            if group.resource_types.is_empty() {
                bail!("{entry}: at least one resource type is required");
            }
            group.selection.validate(&entry)?;
        }

        for (i, tag) in self.resource_tags.iter().enumerate() {
            let entry = format!("resource_tags[{i}]");
            if tag.resource_tag_name.is_empty() {
                bail!("{entry}: resource_tag_name is required");
            }
            tag.selection.validate(&entry)?;
        }

        Ok(())
    }

    fn compile_filters(&mut self) -> Result<()> {
        for (i, group) in self.resource_groups.iter_mut().enumerate() {
            group.name_filter =
                NameFilter::new(&group.resource_name_include_re, &group.resource_name_exclude_re)
                    .with_context(|| format!("resource_groups[{i}]"))?;
        }

        Ok(())
    }

    /// Listen address in a form `TcpListener::bind` accepts.
    pub fn bind_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }
}
