//! Fan-out uploads with one recorded outcome per item.

use assessor_core::ActionResult;
use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::rest::{ObjectStore, StoredObject};
use crate::ObjectStoreError;

#[derive(Debug, Clone)]
pub struct UploadItem {
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub path: String,
    pub result: Result<StoredObject, String>,
}

/// Outcomes in the same order as the submitted items.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub bucket: String,
    pub items: Vec<ItemOutcome>,
}

impl BatchOutcome {
    pub fn is_complete_success(&self) -> bool {
        self.items.iter().all(|i| i.result.is_ok())
    }

    /// First failure in submission order, as `(path, message)`.
    pub fn first_error(&self) -> Option<(&str, &str)> {
        self.items.iter().find_map(|i| match &i.result {
            Err(message) => Some((i.path.as_str(), message.as_str())),
            Ok(_) => None,
        })
    }

    pub fn succeeded(&self) -> Vec<&StoredObject> {
        self.items
            .iter()
            .filter_map(|i| i.result.as_ref().ok())
            .collect()
    }

    /// Collapses the batch into the user-facing tuple. A failure reports only
    /// the first error; nothing is said about the items that did succeed.
    pub fn to_action_result(&self) -> ActionResult {
        match self.first_error() {
            Some((_, message)) => ActionResult::err(message),
            None => ActionResult::ok(format!(
                "Uploaded {} file{}",
                self.items.len(),
                if self.items.len() == 1 { "" } else { "s" }
            )),
        }
    }
}

pub async fn upload_batch(
    store: &dyn ObjectStore,
    bucket: &str,
    items: Vec<UploadItem>,
    concurrency: usize,
) -> BatchOutcome {
    let outcomes = stream::iter(items)
        .map(|item| async move {
            let result = store
                .upload(bucket, &item.path, &item.bytes, &item.content_type)
                .await
                .map_err(|err| err.to_string());
            ItemOutcome {
                path: item.path,
                result,
            }
        })
        .buffered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    BatchOutcome {
        bucket: bucket.to_string(),
        items: outcomes,
    }
}

/// Removes every object the batch managed to store. Objects that were already
/// present before the batch (deduplicated) are left alone.
pub async fn compensate(store: &dyn ObjectStore, outcome: &BatchOutcome) -> Result<usize, ObjectStoreError> {
    let paths = outcome
        .succeeded()
        .into_iter()
        .filter(|o| !o.deduplicated)
        .map(|o| o.path.clone())
        .collect::<Vec<_>>();
    if paths.is_empty() {
        return Ok(0);
    }
    warn!(
        bucket = %outcome.bucket,
        count = paths.len(),
        "removing uploads from partially failed batch"
    );
    store.remove(&outcome.bucket, &paths).await?;
    Ok(paths.len())
}
