//! Filesystem-backed object store for attachments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::rest::{sha256_hex, validate_bucket, validate_object_path, ObjectStore, StoredObject};
use crate::ObjectStoreError;

/// Stores objects under `<root>/<bucket>/<path>`. Objects are written to a
/// temp file and hard-linked into place.
///
/// Uploads never overwrite: re-uploading identical bytes is reported as a
/// deduplicated success, different bytes at an existing path fail.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

fn io_err(context: String) -> impl FnOnce(std::io::Error) -> ObjectStoreError {
    move |source| ObjectStoreError::Io { context, source }
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_bucket(bucket)?;
        validate_object_path(path)?;
        Ok(self.root.join(bucket).join(path.trim()))
    }

    async fn existing_matches(&self, absolute_path: &Path, content_hash: &str) -> Result<bool, ObjectStoreError> {
        let existing = fs::read(absolute_path)
            .await
            .map_err(io_err(format!("reading existing object {}", absolute_path.display())))?;
        Ok(sha256_hex(&existing) == content_hash)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<StoredObject, ObjectStoreError> {
        let absolute_path = self.object_path(bucket, path)?;
        let content_hash = sha256_hex(bytes);
        let stored = |deduplicated| StoredObject {
            bucket: bucket.to_string(),
            path: path.trim().to_string(),
            content_hash: content_hash.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let Some(parent) = absolute_path.parent() else {
            return Err(ObjectStoreError::InvalidPath(path.to_string()));
        };
        fs::create_dir_all(parent)
            .await
            .map_err(io_err(format!("creating object directory {}", parent.display())))?;

        if fs::try_exists(&absolute_path)
            .await
            .map_err(io_err(format!("checking object path {}", absolute_path.display())))?
        {
            return if self.existing_matches(&absolute_path, &content_hash).await? {
                Ok(stored(true))
            } else {
                Err(ObjectStoreError::AlreadyExists)
            };
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(format!("opening temp object file {}", temp_path.display())))?;
        file.write_all(bytes)
            .await
            .map_err(io_err(format!("writing temp object file {}", temp_path.display())))?;
        file.flush()
            .await
            .map_err(io_err(format!("flushing temp object file {}", temp_path.display())))?;
        drop(file);

        // a hard link fails on an existing target where rename would replace it
        let published = fs::hard_link(&temp_path, &absolute_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match published {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.existing_matches(&absolute_path, &content_hash).await? {
                    Ok(stored(true))
                } else {
                    Err(ObjectStoreError::AlreadyExists)
                }
            }
            Err(err) => Err(ObjectStoreError::Io {
                context: format!(
                    "publishing temp object {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                ),
                source: err,
            }),
        }
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), ObjectStoreError> {
        for path in paths {
            let absolute_path = self.object_path(bucket, path)?;
            match fs::remove_file(&absolute_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(ObjectStoreError::Io {
                        context: format!("removing object {}", absolute_path.display()),
                        source: err,
                    })
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{upload_batch, UploadItem};
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_reupload_is_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        let first = store
            .upload("parcel-images", "12/front.jpg", b"jpeg-bytes", "image/jpeg")
            .await
            .expect("first upload");
        let second = store
            .upload("parcel-images", "12/front.jpg", b"jpeg-bytes", "image/jpeg")
            .await
            .expect("second upload");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(dir.path().join("parcel-images/12/front.jpg").exists());
    }

    #[tokio::test]
    async fn different_bytes_at_same_path_fail() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        store
            .upload("docs", "a.pdf", b"one", "application/pdf")
            .await
            .expect("first upload");
        let err = store
            .upload("docs", "a.pdf", b"two", "application/pdf")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "The resource already exists");
    }

    #[tokio::test]
    async fn same_name_in_one_batch_publishes_only_once() {
        let photo = |bytes: &[u8]| UploadItem {
            path: "7/image.jpg".to_string(),
            bytes: bytes.to_vec(),
            content_type: "image/jpeg".to_string(),
        };
        for _ in 0..50 {
            let dir = tempdir().expect("tempdir");
            let store = LocalObjectStore::new(dir.path());
            let outcome = upload_batch(
                &store,
                "parcel-photos",
                vec![photo(b"first-photo"), photo(b"second-photo-different")],
                2,
            )
            .await;

            let published = outcome.succeeded();
            assert_eq!(published.len(), 1);
            assert!(!published[0].deduplicated);
            assert_eq!(
                outcome.first_error().map(|(_, message)| message),
                Some("The resource already exists")
            );

            let on_disk = std::fs::read(dir.path().join("parcel-photos/7/image.jpg")).expect("read");
            assert_eq!(sha256_hex(&on_disk), published[0].content_hash);
            let leftovers = std::fs::read_dir(dir.path().join("parcel-photos/7"))
                .expect("list")
                .count();
            assert_eq!(leftovers, 1);
        }
    }

    #[tokio::test]
    async fn remove_ignores_missing_objects() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        store
            .upload("docs", "keep/b.pdf", b"b", "application/pdf")
            .await
            .expect("upload");
        store
            .remove("docs", &["keep/b.pdf".to_string(), "never/was.pdf".to_string()])
            .await
            .expect("remove");
        assert!(!dir.path().join("docs/keep/b.pdf").exists());
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .upload("docs", "../outside.pdf", b"x", "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidPath(_)));
        let err = store
            .upload("docs/nested", "a.pdf", b"x", "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidPath(_)));
    }
}
