//! Parcel attachment upload and removal.
//!
//! Every outcome, including validation failures and upstream errors, is an
//! [`ActionResult`] served with status 200.

use std::collections::HashSet;
use std::sync::Arc;

use assessor_core::ActionResult;
use assessor_storage::{compensate, upload_batch, Backend, BatchOutcome, ObjectStore, UploadItem};
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{Path as AxumPath, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{parse_parcel_id, AppState};

pub const ATTACHMENTS_TABLE: &str = "parcel_attachments";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Multipart fields of an upload request. File items carry their original
/// file name as `path` until they are placed under the requested prefix.
#[derive(Debug, Clone, Default)]
pub struct AttachmentForm {
    pub bucket: Option<String>,
    pub path: Option<String>,
    pub files: Vec<UploadItem>,
}

impl AttachmentForm {
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, MultipartError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "bucket" => form.bucket = Some(field.text().await?),
                "path" => form.path = Some(field.text().await?),
                "file" | "files" => {
                    let file_name = field.file_name().unwrap_or_default().to_string();
                    let content_type = field
                        .content_type()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
                    let bytes = field.bytes().await?;
                    // browsers send an empty part when no file was picked
                    if file_name.trim().is_empty() && bytes.is_empty() {
                        continue;
                    }
                    form.files.push(UploadItem {
                        path: file_name,
                        bytes: bytes.to_vec(),
                        content_type,
                    });
                }
                _ => {}
            }
        }
        Ok(form)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `prefix/file_name`, with unnamed files numbered by their position.
pub fn object_path(prefix: &str, file_name: &str, index: usize) -> String {
    let prefix = prefix.trim().trim_matches('/');
    let file_name = file_name.trim().rsplit(['/', '\\']).next().unwrap_or_default();
    let file_name = if file_name.is_empty() {
        format!("attachment-{}", index + 1)
    } else {
        file_name.to_string()
    };
    if prefix.is_empty() {
        file_name
    } else {
        format!("{prefix}/{file_name}")
    }
}

/// Returns `path`, or the first free `stem-N.ext` variant of it when an
/// earlier file in the same batch already claimed that path.
pub fn claim_path(path: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(path.clone()) {
        return path;
    }
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path.as_str()),
    };
    let (stem, ext) = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file, None),
    };
    let claimed = (2u32..)
        .map(|n| {
            let name = match ext {
                Some(ext) => format!("{stem}-{n}.{ext}"),
                None => format!("{stem}-{n}"),
            };
            match dir {
                Some(dir) => format!("{dir}/{name}"),
                None => name,
            }
        })
        .find(|candidate| taken.insert(candidate.clone()));
    claimed.unwrap_or(path)
}

pub async fn upload_attachments(
    backend: &dyn Backend,
    objects: &dyn ObjectStore,
    concurrency: usize,
    parcel_id: &str,
    form: AttachmentForm,
) -> ActionResult {
    let Some(parcel_id) = parse_parcel_id(parcel_id) else {
        return ActionResult::err("Missing parcel id");
    };
    let Some(bucket) = non_blank(form.bucket) else {
        return ActionResult::err("Missing bucket");
    };
    let Some(prefix) = non_blank(form.path) else {
        return ActionResult::err("Missing path");
    };
    if form.files.is_empty() {
        return ActionResult::err("No files provided");
    }

    let mut taken = HashSet::new();
    let items = form
        .files
        .into_iter()
        .enumerate()
        .map(|(i, item)| UploadItem {
            path: claim_path(object_path(&prefix, &item.path, i), &mut taken),
            ..item
        })
        .collect::<Vec<_>>();
    let content_types = items
        .iter()
        .map(|i| i.content_type.clone())
        .collect::<Vec<_>>();

    let outcome = upload_batch(objects, &bucket, items, concurrency).await;
    if !outcome.is_complete_success() {
        if let Some((path, message)) = outcome.first_error() {
            warn!(parcel_id, bucket = %bucket, path, error = message, "attachment upload failed");
        }
        roll_back(objects, &outcome).await;
        return outcome.to_action_result();
    }

    let rows = outcome
        .items
        .iter()
        .zip(content_types)
        .map(|(item, content_type)| {
            json!({
                "parcel_id": parcel_id,
                "bucket": outcome.bucket,
                "path": item.path,
                "content_type": content_type,
            })
        })
        .collect::<Vec<_>>();
    if let Err(err) = backend.insert(ATTACHMENTS_TABLE, rows).await {
        warn!(parcel_id, bucket = %bucket, error = %err, "recording attachments failed");
        roll_back(objects, &outcome).await;
        return ActionResult::err(err.to_string());
    }

    info!(parcel_id, bucket = %bucket, files = outcome.items.len(), "attachments uploaded");
    outcome.to_action_result()
}

async fn roll_back(objects: &dyn ObjectStore, outcome: &BatchOutcome) {
    if let Err(err) = compensate(objects, outcome).await {
        warn!(bucket = %outcome.bucket, error = %err, "could not remove uploaded attachments");
    }
}

pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(parcel_id): AxumPath<String>,
    multipart: Multipart,
) -> Json<ActionResult> {
    let form = match AttachmentForm::from_multipart(multipart).await {
        Ok(form) => form,
        Err(err) => return Json(ActionResult::err(err.to_string())),
    };
    Json(
        upload_attachments(
            state.backend.as_ref(),
            state.objects.as_ref(),
            state.upload_concurrency,
            &parcel_id,
            form,
        )
        .await,
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveRequest {
    #[serde(default)]
    pub paths: Vec<String>,
}

pub async fn remove_objects(objects: &dyn ObjectStore, bucket: &str, paths: Vec<String>) -> ActionResult {
    if bucket.trim().is_empty() {
        return ActionResult::err("Missing bucket");
    }
    let paths = paths
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    if paths.is_empty() {
        return ActionResult::err("No paths provided");
    }
    match objects.remove(bucket, &paths).await {
        Ok(()) => ActionResult::ok(format!(
            "Removed {} file{}",
            paths.len(),
            if paths.len() == 1 { "" } else { "s" }
        )),
        Err(err) => {
            warn!(bucket, error = %err, "removing objects failed");
            ActionResult::err(err.to_string())
        }
    }
}

pub async fn remove_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(bucket): AxumPath<String>,
    Json(request): Json<RemoveRequest>,
) -> Json<ActionResult> {
    Json(remove_objects(state.objects.as_ref(), &bucket, request.paths).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths_join_prefix_and_file_name() {
        assert_eq!(object_path("parcels/42/", "front.jpg", 0), "parcels/42/front.jpg");
        assert_eq!(object_path("/docs", "C:\\scans\\deed.pdf", 0), "docs/deed.pdf");
        assert_eq!(object_path("docs", "  ", 2), "docs/attachment-3");
    }

    #[test]
    fn repeated_names_get_numbered() {
        let mut taken = HashSet::new();
        let claimed = ["7/image.jpg", "7/image.jpg", "7/image.jpg", "7/image-2.jpg", "7/notes", "7/notes", "7/.env", "7/.env"]
            .into_iter()
            .map(|p| claim_path(p.to_string(), &mut taken))
            .collect::<Vec<_>>();
        assert_eq!(
            claimed,
            vec![
                "7/image.jpg",
                "7/image-2.jpg",
                "7/image-3.jpg",
                "7/image-2-2.jpg",
                "7/notes",
                "7/notes-2",
                "7/.env",
                "7/.env-2",
            ]
        );
    }
}
