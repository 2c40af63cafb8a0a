use anyhow::anyhow;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::CollectError;
use crate::azure::AzureApi;

/// Sub-requests per batch call when not configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// What a batch call was fetching, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Lookup,
    Metrics,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Metrics => "metrics",
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded sub-response, positionally matched to its request.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub status: u16,
    pub content: T,
}

impl<T> BatchItem<T> {
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }
}

fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Run `urls` through the batch API in chunks of at most `batch_size`.
///
/// Results keep input order. The first failing chunk aborts the whole
/// operation and nothing from earlier chunks is returned. A sub-response
/// with a non-2xx status whose body does not decode as `T` yields
/// `T::default()`, leaving the status for the caller to act on.
pub async fn execute_batch<C, T>(
    api: &C,
    urls: &[String],
    batch_size: usize,
    kind: BatchKind,
) -> Result<Vec<BatchItem<T>>, CollectError>
where
    C: AzureApi,
    T: DeserializeOwned + Default,
{
    let batch_size = batch_size.max(1);
    let chunks = urls.len().div_ceil(batch_size);
    let mut results = Vec::with_capacity(urls.len());

    for (i, chunk) in urls.chunks(batch_size).enumerate() {
        let chunk_no = i + 1;
        let fail = |source: anyhow::Error| CollectError::Batch {
            kind,
            chunk: chunk_no,
            chunks,
            source,
        };

        debug!(%kind, chunk = chunk_no, chunks, requests = chunk.len(), "sending batch");

        let items = api.batch(chunk).await.map_err(fail)?;
        if items.len() != chunk.len() {
            return Err(fail(anyhow!(
                "batch returned {} responses for {} requests",
                items.len(),
                chunk.len()
            )));
        }

        for (offset, item) in items.into_iter().enumerate() {
            let index = i * batch_size + offset;
            let status = item.http_status_code;
            let content = match serde_json::from_value(item.content) {
                Ok(content) => content,
                Err(e) if !is_success_status(status) => {
                    debug!(%kind, index, status, error = %e, "undecodable error response");
                    T::default()
                }
                Err(e) => {
                    return Err(fail(anyhow!(e).context(format!("decoding response {index}"))));
                }
            };

            results.push(BatchItem { status, content });
        }
    }

    Ok(results)
}
