use tracing::debug;

use super::batch::{execute_batch, BatchItem, BatchKind};
use super::CollectError;
use crate::azure::types::AzureResource;
use crate::azure::AzureApi;
use crate::resource::{lookup_url, resource_type, ResourceDescriptor};

/// Fill in metadata for every descriptor that lacks it.
///
/// Descriptors with a resolved `resource.id` are left alone, so running this
/// twice issues no further lookups. Returns the number of descriptors
/// completed.
pub async fn complete_metadata<C: AzureApi>(
    api: &C,
    descriptors: &mut [ResourceDescriptor],
    subscription_id: &str,
    batch_size: usize,
) -> Result<usize, CollectError> {
    let mut pending = Vec::new();
    let mut urls = Vec::new();

    for (index, descriptor) in descriptors.iter().enumerate() {
        if !descriptor.needs_metadata() {
            continue;
        }

        let resource_type =
            resource_type(&descriptor.resource_url).ok_or_else(|| CollectError::UnknownResourceType {
                resource: descriptor.resource_id.clone(),
            })?;

        let api_version = api
            .api_version_for(&resource_type)
            .ok_or(CollectError::UnknownApiVersion { resource_type })?;

        urls.push(lookup_url(&descriptor.resource_id, &api_version, subscription_id));
        pending.push(index);
    }

    if urls.is_empty() {
        return Ok(0);
    }

    debug!(resources = urls.len(), "looking up resource metadata");

    let items: Vec<BatchItem<AzureResource>> =
        execute_batch(api, &urls, batch_size, BatchKind::Lookup).await?;

    // Check every answer before touching any descriptor.
    if let Some((index, item)) = pending
        .iter()
        .zip(&items)
        .find(|(_, item)| !item.is_success() || item.content.id.is_empty())
    {
        return Err(CollectError::ResourceLookup {
            resource: descriptors[*index].resource_id.clone(),
            status: item.status,
        });
    }

    for (index, item) in pending.iter().copied().zip(items) {
        let descriptor = &mut descriptors[index];
        descriptor.resource = item.content;
        descriptor.resource.subscription = subscription_id.to_string();
    }

    Ok(pending.len())
}
