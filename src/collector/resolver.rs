use std::collections::HashMap;

use anyhow::Result;
use tracing::debug;

use super::CollectError;
use crate::azure::types::AzureResource;
use crate::azure::{AzureApi, ResourceFilter};
use crate::config::Config;
use crate::resource::{relative_resource_id, QueryWindow, ResourceDescriptor};

/// Expands configuration entries into resource descriptors for one scrape.
///
/// Listing results are cached by filter for the lifetime of the resolver,
/// which never outlives a single collection pass.
pub struct Resolver<'a, C> {
    api: &'a C,
    config: &'a Config,
    window: QueryWindow,
    cache: HashMap<ResourceFilter, Vec<AzureResource>>,
    listing_calls: usize,
}

impl<'a, C: AzureApi> Resolver<'a, C> {
    pub fn new(api: &'a C, config: &'a Config, window: QueryWindow) -> Self {
        Self {
            api,
            config,
            window,
            cache: HashMap::new(),
            listing_calls: 0,
        }
    }

    fn subscription_id(&self) -> &str {
        &self.config.credentials.subscription_id
    }

    /// Listing calls actually sent to the API so far.
    pub fn listing_calls(&self) -> usize {
        self.listing_calls
    }

    /// One descriptor per configured target, metadata unresolved.
    pub fn targets(&self) -> Vec<ResourceDescriptor> {
        self.config
            .targets
            .iter()
            .map(|t| {
                ResourceDescriptor::new(self.subscription_id(), &t.resource, &t.selection, &self.window)
            })
            .collect()
    }

    /// Descriptors for tag-selected resources, metadata unresolved.
    pub async fn tagged(&mut self) -> Result<Vec<ResourceDescriptor>, CollectError> {
        let config = self.config;
        let mut descriptors = Vec::new();

        for tag in &config.resource_tags {
            let filter = ResourceFilter::Tag {
                name: tag.resource_tag_name.clone(),
                value: tag.resource_tag_value.clone(),
            };

            let listed = self
                .list_cached(filter)
                .await
                .map_err(|source| CollectError::TagListing {
                    name: tag.resource_tag_name.clone(),
                    value: tag.resource_tag_value.clone(),
                    source,
                })?;

            descriptors.extend(
                listed
                    .iter()
                    .filter(|r| type_matches(r, &tag.resource_types))
                    .map(|r| {
                        ResourceDescriptor::new(
                            self.subscription_id(),
                            relative_resource_id(&r.id),
                            &tag.selection,
                            &self.window,
                        )
                    }),
            );
        }

        Ok(descriptors)
    }

    /// Descriptors for resource-group resources, metadata already filled in.
    pub async fn resource_groups(&mut self) -> Result<Vec<ResourceDescriptor>, CollectError> {
        let config = self.config;
        let mut descriptors = Vec::new();

        for group in &config.resource_groups {
            let filter = ResourceFilter::ResourceGroup {
                group: group.resource_group.clone(),
            };

            let listed = self
                .list_cached(filter)
                .await
                .map_err(|source| CollectError::ResourceGroupListing {
                    group: group.resource_group.clone(),
                    source,
                })?;

            descriptors.extend(
                listed
                    .iter()
                    .filter(|r| type_matches(r, &group.resource_types))
                    .filter(|r| group.name_filter.matches(&r.name))
                    .map(|r| {
                        let mut resource = r.clone();
                        resource.subscription = self.subscription_id().to_string();
                        ResourceDescriptor::new(
                            self.subscription_id(),
                            relative_resource_id(&r.id),
                            &group.selection,
                            &self.window,
                        )
                        .with_resource(resource)
                    }),
            );
        }

        Ok(descriptors)
    }

    async fn list_cached(&mut self, filter: ResourceFilter) -> Result<Vec<AzureResource>> {
        if let Some(cached) = self.cache.get(&filter) {
            debug!(%filter, resources = cached.len(), "resource listing cache hit");
            return Ok(cached.clone());
        }

        self.listing_calls += 1;
        let listed = self.api.list_resources(&filter).await?;
        debug!(%filter, resources = listed.len(), "listed resources");

        self.cache.insert(filter, listed.clone());
        Ok(listed)
    }
}

/// Case-insensitive type filter. No configured types keeps everything.
fn type_matches(resource: &AzureResource, types: &[String]) -> bool {
    types.is_empty()
        || types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&resource.resource_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};

    use crate::collector::testing::FakeAzure;
    use crate::config::{Credentials, Metric, MetricSelection, ResourceGroup, ResourceTag, Target};

    fn selection() -> MetricSelection {
        MetricSelection {
            metrics: vec![Metric {
                name: "Requests".to_string(),
            }],
            ..Default::default()
        }
    }

    fn window() -> QueryWindow {
        QueryWindow::ending_at(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid time"),
            std::time::Duration::from_secs(60),
        )
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

    fn tag(name: &str, value: &str, types: &[&str]) -> ResourceTag {
        ResourceTag {
            resource_tag_name: name.to_string(),
            resource_tag_value: value.to_string(),
            resource_types: types.iter().map(|t| t.to_string()).collect(),
            selection: selection(),
        }
    }

    fn group(name: &str, types: &[&str]) -> ResourceGroup {
        ResourceGroup {
            resource_group: name.to_string(),
            resource_types: types.iter().map(|t| t.to_string()).collect(),
            resource_name_include_re: Vec::new(),
            resource_name_exclude_re: Vec::new(),
            selection: selection(),
            name_filter: Default::default(),
        }
    }

    #[test]
    fn test_targets_pass_through() {
        let mut cfg = config();
        cfg.targets.push(Target {
            resource: "/resourceGroups/rg/providers/Microsoft.Web/sites/app".to_string(),
            selection: selection(),
        });

        let api = FakeAzure::default();
        let resolver = Resolver::new(&api, &cfg, window());
        let targets = resolver.targets();

        assert_eq!(targets.len(), 1);
        assert!(targets[0].needs_metadata());
        assert_eq!(
            targets[0].resource_id,
            "/resourceGroups/rg/providers/Microsoft.Web/sites/app"
        );
        assert!(targets[0]
            .resource_url
            .starts_with("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Web/sites/app/providers/microsoft.insights/metrics?"));
    }

    #[tokio::test]
    async fn test_tag_listing_cached_within_scrape() {
        let mut cfg = config();
        cfg.resource_tags.push(tag("env", "prod", &[]));
        cfg.resource_tags.push(tag("env", "prod", &["Microsoft.Web/sites"]));

        let api = FakeAzure::default().with_listing(
            ResourceFilter::Tag {
                name: "env".to_string(),
                value: "prod".to_string(),
            },
            vec![
                FakeAzure::resource("rg", "Microsoft.Web/sites", "app"),
                FakeAzure::resource("rg", "Microsoft.Sql/servers", "db"),
            ],
        );

        let mut resolver = Resolver::new(&api, &cfg, window());
        let tagged = resolver.tagged().await.expect("tagged");

        assert_eq!(api.listing_calls(), 1);
        assert_eq!(resolver.listing_calls(), 1);
        assert_eq!(tagged.len(), 3);
        assert!(tagged.iter().all(ResourceDescriptor::needs_metadata));
        assert_eq!(
            tagged[2].resource_id,
            "/resourceGroups/rg/providers/Microsoft.Web/sites/app"
        );
    }

    #[tokio::test]
    async fn test_group_resources_are_complete_and_filtered() {
        let mut cfg = config();
        let mut g = group("rg", &["microsoft.web/SITES"]);
        g.name_filter = crate::config::NameFilter::new(&[], &["^skip".to_string()])
            .expect("valid pattern");
        cfg.resource_groups.push(g);

        let api = FakeAzure::default().with_listing(
            ResourceFilter::ResourceGroup {
                group: "rg".to_string(),
            },
            vec![
                FakeAzure::resource("rg", "Microsoft.Web/sites", "app"),
                FakeAzure::resource("rg", "Microsoft.Web/sites", "skip-me"),
                FakeAzure::resource("rg", "Microsoft.Sql/servers", "db"),
            ],
        );

        let mut resolver = Resolver::new(&api, &cfg, window());
        let groups = resolver.resource_groups().await.expect("groups");

        assert_eq!(groups.len(), 1);
        assert!(!groups[0].needs_metadata());
        assert_eq!(groups[0].resource.subscription, "sub");
        assert_eq!(groups[0].resource.name, "app");
    }

    #[tokio::test]
    async fn test_listing_errors_identify_section() {
        let mut cfg = config();
        cfg.resource_groups.push(group("missing", &["Microsoft.Web/sites"]));
        cfg.resource_tags.push(tag("team", "core", &[]));

        let api = FakeAzure::default();
        let mut resolver = Resolver::new(&api, &cfg, window());

        let err = resolver.tagged().await.unwrap_err();
        assert!(matches!(err, CollectError::TagListing { ref name, .. } if name == "team"));

        let err = resolver.resource_groups().await.unwrap_err();
        assert!(matches!(err, CollectError::ResourceGroupListing { ref group, .. } if group == "missing"));
    }

    #[test]
    fn test_type_matches() {
        let r = FakeAzure::resource("rg", "Microsoft.Web/sites", "a");
        assert!(type_matches(&r, &[]));
        assert!(type_matches(&r, &["MICROSOFT.WEB/SITES".to_string()]));
        assert!(!type_matches(&r, &["Microsoft.Web/serverFarms".to_string()]));
    }
}
