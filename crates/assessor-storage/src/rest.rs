//! REST gateway client for the hosted store.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context};
use assessor_core::{FilterOp, ListQuery};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, Url};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};

use crate::retry::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};
use crate::{ObjectStoreError, StoreConfig, StoreError};

/// What a list query runs against.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table(String),
    Rpc {
        function: String,
        args: Map<String, JsonValue>,
    },
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Table(name) => write!(f, "table:{name}"),
            Source::Rpc { function, .. } => write!(f, "rpc:{function}"),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, source: &Source, query: &ListQuery) -> Result<Vec<JsonValue>, StoreError>;

    /// Total rows matching the query's filters, ignoring paging.
    async fn count(&self, source: &Source, query: &ListQuery) -> Result<u64, StoreError>;

    async fn insert(&self, table: &str, rows: Vec<JsonValue>) -> Result<Vec<JsonValue>, StoreError>;

    async fn rpc(&self, function: &str, args: &JsonValue) -> Result<JsonValue, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    pub bucket: String,
    pub path: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, ObjectStoreError>;

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), ObjectStoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rejects empty, absolute and parent-escaping object paths.
pub(crate) fn validate_object_path(path: &str) -> Result<(), ObjectStoreError> {
    let trimmed = path.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('/')
        || trimmed.contains('\\')
        || trimmed.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(ObjectStoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// A bucket is a single clean path segment.
pub(crate) fn validate_bucket(bucket: &str) -> Result<(), ObjectStoreError> {
    validate_object_path(bucket)?;
    if bucket.contains('/') {
        return Err(ObjectStoreError::InvalidPath(bucket.to_string()));
    }
    Ok(())
}

/// Query-string parameters in the gateway's filter dialect.
pub fn rest_params(query: &ListQuery, paged: bool) -> Vec<(String, String)> {
    let mut params = query
        .filters
        .iter()
        .map(|f| (f.column.clone(), render_filter(&f.op)))
        .collect::<Vec<_>>();
    if !query.sort.is_empty() {
        params.push(("order".to_string(), query.sort_string()));
    }
    if paged {
        params.push(("offset".to_string(), query.offset().to_string()));
        params.push(("limit".to_string(), query.page_size.to_string()));
    }
    params
}

fn render_filter(op: &FilterOp) -> String {
    match op {
        FilterOp::Eq(v)
        | FilterOp::Neq(v)
        | FilterOp::Gt(v)
        | FilterOp::Gte(v)
        | FilterOp::Lt(v)
        | FilterOp::Lte(v) => format!("{}.{}", op.name(), v),
        FilterOp::ILike(pattern) => format!("ilike.{}", pattern.replace('%', "*")),
        FilterOp::In(values) => format!(
            "in.({})",
            values
                .iter()
                .map(|v| quote_list_value(v))
                .collect::<Vec<_>>()
                .join(",")
        ),
        FilterOp::Is(v) => format!("is.{}", v.as_str()),
    }
}

fn quote_list_value(value: &str) -> String {
    if value.contains([',', '(', ')', '"', ' ', '\\']) {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Reads the total from a `Content-Range` header such as `0-24/310` or `*/0`.
pub fn parse_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Client for the hosted store's REST, RPC and storage endpoints.
#[derive(Debug, Clone)]
pub struct HostedStore {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HostedStore {
    pub fn new(config: &StoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        let base_url = Url::parse(config.base_url.trim())
            .with_context(|| format!("parsing store url '{}'", config.base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("store url '{}' cannot carry a path", config.base_url);
        }
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// Appends each segment to the base url, percent-encoded.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    fn source_request(&self, source: &Source, params: &[(String, String)]) -> RequestBuilder {
        let builder = match source {
            Source::Table(table) => self
                .client
                .get(self.endpoint(["rest", "v1", table.as_str()]))
                .query(&[("select", "*")]),
            Source::Rpc { function, args } => self
                .client
                .post(self.endpoint(["rest", "v1", "rpc", function.as_str()]))
                .json(args),
        };
        self.authorize(builder.query(params))
    }

    async fn send<F>(&self, retries: usize, build: F) -> Result<Response, StoreError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let _permit = self.limit.acquire().await.map_err(|_| StoreError::Closed)?;

        for attempt in 0..=retries {
            match build().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    if classify_status(resp.status()) == RetryDisposition::Retryable
                        && attempt < retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(status_error(resp).await);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }
        Err(StoreError::Decode("retry loop exhausted without a response".into()))
    }
}

async fn status_error(resp: Response) -> StoreError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<JsonValue>(&text)
        .ok()
        .and_then(|v| {
            ["message", "error", "msg"]
                .iter()
                .find_map(|k| v.get(k).and_then(JsonValue::as_str).map(ToString::to_string))
        })
        .filter(|m| !m.is_empty())
        .or_else(|| Some(text.trim().to_string()).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    StoreError::Status {
        status: status.as_u16(),
        message,
    }
}

async fn decode_json(resp: Response) -> Result<JsonValue, StoreError> {
    let bytes = resp.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(JsonValue::Null);
    }
    serde_json::from_slice(&bytes).map_err(|err| StoreError::Decode(err.to_string()))
}

fn into_rows(value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(rows) => rows,
        JsonValue::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
impl Backend for HostedStore {
    async fn select(&self, source: &Source, query: &ListQuery) -> Result<Vec<JsonValue>, StoreError> {
        let params = rest_params(query, true);
        let span = info_span!("store_select", %source, page = query.page);
        async {
            let resp = self
                .send(self.backoff.max_retries, || self.source_request(source, &params))
                .await?;
            Ok::<_, StoreError>(into_rows(decode_json(resp).await?))
        }
        .instrument(span)
        .await
    }

    async fn count(&self, source: &Source, query: &ListQuery) -> Result<u64, StoreError> {
        let mut params = rest_params(query, false);
        params.push(("limit".to_string(), "1".to_string()));
        let span = info_span!("store_count", %source);
        async {
            let resp = self
                .send(self.backoff.max_retries, || {
                    self.source_request(source, &params)
                        .header("Prefer", "count=exact")
                })
                .await?;
            let header = resp
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            header
                .as_deref()
                .and_then(parse_content_range)
                .ok_or_else(|| {
                    StoreError::Decode(format!(
                        "missing or unreadable content-range for {source}: {header:?}"
                    ))
                })
        }
        .instrument(span)
        .await
    }

    async fn insert(&self, table: &str, rows: Vec<JsonValue>) -> Result<Vec<JsonValue>, StoreError> {
        let url = self.endpoint(["rest", "v1", table]);
        let body = JsonValue::Array(rows);
        let span = info_span!("store_insert", table);
        async {
            let resp = self
                .send(0, || {
                    self.authorize(self.client.post(url.clone()))
                        .header("Prefer", "return=representation")
                        .json(&body)
                })
                .await?;
            Ok::<_, StoreError>(into_rows(decode_json(resp).await?))
        }
        .instrument(span)
        .await
    }

    async fn rpc(&self, function: &str, args: &JsonValue) -> Result<JsonValue, StoreError> {
        let url = self.endpoint(["rest", "v1", "rpc", function]);
        let span = info_span!("store_rpc", function);
        async {
            let resp = self
                .send(self.backoff.max_retries, || {
                    self.authorize(self.client.post(url.clone())).json(args)
                })
                .await?;
            decode_json(resp).await
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl ObjectStore for HostedStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredObject, ObjectStoreError> {
        validate_bucket(bucket)?;
        validate_object_path(path)?;
        let path = path.trim();
        let url = self.endpoint(["storage", "v1", "object", bucket].into_iter().chain(path.split('/')));
        let span = info_span!("object_upload", bucket, path, bytes = bytes.len());
        async {
            self.send(0, || {
                self.authorize(self.client.post(url.clone()))
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .header("x-upsert", "false")
                    .body(bytes.to_vec())
            })
            .await?;
            Ok::<_, ObjectStoreError>(StoredObject {
                bucket: bucket.to_string(),
                path: path.to_string(),
                content_hash: sha256_hex(bytes),
                byte_size: bytes.len(),
                deduplicated: false,
            })
        }
        .instrument(span)
        .await
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), ObjectStoreError> {
        validate_bucket(bucket)?;
        if paths.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(["storage", "v1", "object", bucket]);
        let body = serde_json::json!({ "prefixes": paths });
        self.send(0, || self.authorize(self.client.delete(url.clone())).json(&body))
            .instrument(info_span!("object_remove", bucket, count = paths.len()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assessor_core::PageLimits;
    use axum::{
        extract::{Path as AxumPath, Query, State},
        http::{HeaderMap, StatusCode, Uri},
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use std::sync::Mutex;

    fn query(pairs: &[(&str, &str)]) -> ListQuery {
        ListQuery::from_pairs(pairs.iter().copied(), PageLimits::default()).unwrap()
    }

    #[test]
    fn params_use_gateway_dialect() {
        let q = query(&[
            ("eq_district", "4"),
            ("in_land_use", "R1,Multi Family"),
            ("ilike_street", "oak"),
            ("is_void", "false"),
            ("sort", "-sale_date"),
            ("page", "2"),
            ("page_size", "25"),
        ]);
        let params = rest_params(&q, true);
        assert_eq!(
            params,
            vec![
                ("district".to_string(), "eq.4".to_string()),
                ("land_use".to_string(), "in.(R1,\"Multi Family\")".to_string()),
                ("street".to_string(), "ilike.*oak*".to_string()),
                ("void".to_string(), "is.false".to_string()),
                ("order".to_string(), "sale_date.desc".to_string()),
                ("offset".to_string(), "25".to_string()),
                ("limit".to_string(), "25".to_string()),
            ]
        );
        assert!(!rest_params(&q, false).iter().any(|(k, _)| k == "limit"));
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(parse_content_range("0-24/310"), Some(310));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-24/*"), None);
    }

    #[test]
    fn object_paths_must_be_relative_and_clean() {
        assert!(validate_object_path("parcels/12/photo.jpg").is_ok());
        assert!(validate_object_path("/abs.jpg").is_err());
        assert!(validate_object_path("a/../b.jpg").is_err());
        assert!(validate_object_path("a//b.jpg").is_err());
        assert!(validate_object_path("  ").is_err());
        assert!(validate_bucket("parcel-photos").is_ok());
        assert!(validate_bucket("photos/7").is_err());
    }

    #[test]
    fn endpoint_segments_are_percent_encoded() {
        let store = HostedStore::new(&StoreConfig {
            base_url: "http://127.0.0.1:9/gateway/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            store
                .endpoint(["storage", "v1", "object", "docs", "7", "deed #2?.pdf"])
                .as_str(),
            "http://127.0.0.1:9/gateway/storage/v1/object/docs/7/deed%20%232%3F.pdf"
        );
        assert_eq!(
            store.endpoint(["rest", "v1", "sales"]).as_str(),
            "http://127.0.0.1:9/gateway/rest/v1/sales"
        );
    }

    #[test]
    fn unusable_base_urls_are_rejected() {
        for base_url in ["", "not a url", "mailto:records@example.org"] {
            let config = StoreConfig {
                base_url: base_url.into(),
                ..Default::default()
            };
            assert!(HostedStore::new(&config).is_err(), "{base_url}");
        }
    }

    #[tokio::test]
    async fn buckets_with_separators_never_reach_the_gateway() {
        let store = HostedStore::new(&StoreConfig::default()).unwrap();
        let err = store
            .upload("docs/../admin", "7/deed.pdf", b"pdf", "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidPath(_)));
        let err = store
            .remove("docs/7", &["deed.pdf".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidPath(_)));
    }

    async fn sales(Query(params): Query<Vec<(String, String)>>, headers: HeaderMap) -> impl IntoResponse {
        let district = params
            .iter()
            .find(|(k, _)| k == "district")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let mut resp_headers = HeaderMap::new();
        if headers.get("prefer").and_then(|v| v.to_str().ok()) == Some("count=exact") {
            resp_headers.insert("content-range", "0-0/42".parse().unwrap());
        }
        (
            resp_headers,
            Json(serde_json::json!([{ "id": 1, "district_filter": district }])),
        )
    }

    async fn failing_rpc() -> impl IntoResponse {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "message": "function get_ratios(x) does not exist" })),
        )
    }

    type Received = Arc<Mutex<Vec<(String, String)>>>;

    /// Records the raw request path and the decoded object key.
    async fn record_upload(
        State(received): State<Received>,
        uri: Uri,
        AxumPath((bucket, key)): AxumPath<(String, String)>,
    ) -> impl IntoResponse {
        received.lock().unwrap().push((
            uri.path().to_string(),
            format!("{bucket}/{}", key.trim_start_matches('/')),
        ));
        Json(serde_json::json!({ "Key": format!("{bucket}/{key}") }))
    }

    async fn spawn_storage() -> (String, Received) {
        let received = Received::default();
        let app = Router::new()
            .route("/storage/v1/object/{bucket}/{*key}", post(record_upload))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), received)
    }

    #[tokio::test]
    async fn uploaded_object_keys_survive_reserved_characters() {
        let (base_url, received) = spawn_storage().await;
        let store = HostedStore::new(&StoreConfig {
            base_url,
            ..Default::default()
        })
        .unwrap();
        let stored = store
            .upload("docs", "7/deed #2?.pdf", b"pdf-bytes", "application/pdf")
            .await
            .unwrap();
        assert_eq!(stored.path, "7/deed #2?.pdf");

        let received = received.lock().unwrap();
        assert_eq!(
            *received,
            vec![(
                "/storage/v1/object/docs/7/deed%20%232%3F.pdf".to_string(),
                "docs/7/deed #2?.pdf".to_string()
            )]
        );
    }

    async fn spawn_gateway() -> String {
        let app = Router::new()
            .route("/rest/v1/sales", get(sales))
            .route("/rest/v1/rpc/get_ratios", post(failing_rpc));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn select_and_count_against_gateway() {
        let base_url = spawn_gateway().await;
        let store = HostedStore::new(&StoreConfig {
            base_url,
            ..Default::default()
        })
        .unwrap();
        let source = Source::Table("sales".into());
        let q = query(&[("eq_district", "7")]);

        let rows = store.select(&source, &q).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["district_filter"], "eq.7");

        assert_eq!(store.count(&source, &q).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn upstream_message_passes_through_verbatim() {
        let base_url = spawn_gateway().await;
        let store = HostedStore::new(&StoreConfig {
            base_url,
            ..Default::default()
        })
        .unwrap();
        let err = store
            .rpc("get_ratios", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "function get_ratios(x) does not exist");
        assert!(matches!(err, StoreError::Status { status: 400, .. }));
    }
}
