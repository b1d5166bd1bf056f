//! Clients for the hosted relational store and its object storage.
//!
//! Table queries, counts, inserts and RPC calls go through [`Backend`];
//! attachment bytes go through [`ObjectStore`]. [`HostedStore`] implements
//! both against the REST gateway, [`LocalObjectStore`] keeps attachments on
//! disk.

use std::path::PathBuf;
use std::time::Duration;

pub mod batch;
pub mod local;
pub mod rest;
pub mod retry;

pub use batch::{compensate, upload_batch, BatchOutcome, ItemOutcome, UploadItem};
pub use local::LocalObjectStore;
pub use rest::{rest_params, Backend, HostedStore, ObjectStore, Source, StoredObject};
pub use retry::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};

use thiserror::Error;

pub const CRATE_NAME: &str = "assessor-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Non-success response. Displays the service's own message unchanged.
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("store client is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid object path '{0}'")]
    InvalidPath(String),
    #[error("The resource already exists")]
    AlreadyExists,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub local_storage_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            concurrency: 16,
            backoff: BackoffPolicy::default(),
            local_storage_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from a variable lookup. Blank values count as unset.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            base_url: var("ASSESSOR_STORE_URL")
                .map(|v| v.trim().to_string())
                .unwrap_or(defaults.base_url),
            api_key: var("ASSESSOR_STORE_KEY"),
            timeout: var("ASSESSOR_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            concurrency: var("ASSESSOR_STORE_CONCURRENCY")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.concurrency),
            backoff: BackoffPolicy {
                max_retries: var("ASSESSOR_HTTP_MAX_RETRIES")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(defaults.backoff.max_retries),
                ..defaults.backoff
            },
            local_storage_dir: var("ASSESSOR_LOCAL_STORAGE_DIR").map(PathBuf::from),
        }
    }
}
