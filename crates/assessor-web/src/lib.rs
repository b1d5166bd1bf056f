//! JSON API for assessment records: list endpoints over the hosted store,
//! comparable sales per parcel, and parcel attachments.

use std::path::PathBuf;
use std::sync::Arc;

use assessor_comps::{map_points, CompDefaults, CompFetchClient, CompForm, CompQueryState, RpcCompScorer};
use assessor_core::{
    ComparableRow, ListQuery, ListResponse, MapPoint, PageLimits, PageMeta, QueryParseError, SubjectFeatures,
};
use assessor_storage::{Backend, HostedStore, LocalObjectStore, ObjectStore, StoreConfig, StoreError};
use axum::{
    extract::{DefaultBodyLimit, Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub mod attachments;
pub mod resources;

pub use resources::{ResourceDef, ResourceKind, ResourceRegistry, PARCEL_FEATURES_FUNCTION};

pub const CRATE_NAME: &str = "assessor-web";

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub resources_path: PathBuf,
    pub upload_concurrency: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            resources_path: PathBuf::from("resources.yaml"),
            upload_concurrency: 4,
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("ASSESSOR_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            resources_path: std::env::var("ASSESSOR_RESOURCES")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.resources_path),
            upload_concurrency: std::env::var("ASSESSOR_UPLOAD_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.upload_concurrency),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub objects: Arc<dyn ObjectStore>,
    pub comps: Arc<CompFetchClient>,
    pub resources: Arc<ResourceRegistry>,
    pub limits: PageLimits,
    pub upload_concurrency: usize,
}

impl AppState {
    /// Comps are scored by the backend's `get_parcel_comps` procedure.
    pub fn new(backend: Arc<dyn Backend>, objects: Arc<dyn ObjectStore>, resources: ResourceRegistry) -> Self {
        let scorer = Arc::new(RpcCompScorer::new(backend.clone()));
        Self {
            comps: Arc::new(CompFetchClient::new(scorer, CompDefaults::default())),
            backend,
            objects,
            resources: Arc::new(resources),
            limits: PageLimits::default(),
            upload_concurrency: WebConfig::default().upload_concurrency,
        }
    }

    pub fn with_upload_concurrency(mut self, upload_concurrency: usize) -> Self {
        self.upload_concurrency = upload_concurrency.max(1);
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/parcels/features", get(features_handler))
        .route("/parcels/api", get(parcels_list_handler))
        .route("/parcels/{id}/comps", get(comps_handler))
        .route(
            "/parcels/{id}/attachments",
            post(attachments::upload_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/storage/{bucket}", delete(attachments::remove_handler))
        .route("/{resource}/api", get(resource_list_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let store_config = StoreConfig::from_env();
    let hosted = Arc::new(HostedStore::new(&store_config)?);
    let objects: Arc<dyn ObjectStore> = match &store_config.local_storage_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "keeping attachments on local disk");
            Arc::new(LocalObjectStore::new(dir))
        }
        None => hosted.clone(),
    };
    let resources = ResourceRegistry::load_or_builtin(&config.resources_path)?;
    let state = AppState::new(hosted, objects, resources).with_upload_concurrency(config.upload_concurrency);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, store = %store_config.base_url, "assessor api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub(crate) fn parse_parcel_id(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })).into_response()
}

async fn features_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    list_resource(&state, &state.resources.features(), pairs).await
}

async fn parcels_list_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    list_named(&state, "parcels", pairs).await
}

async fn resource_list_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(resource): AxumPath<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    list_named(&state, &resource, pairs).await
}

async fn list_named(state: &AppState, resource: &str, pairs: Vec<(String, String)>) -> Response {
    match state.resources.get(resource) {
        Some(def) => list_resource(state, def, pairs).await,
        None => json_error(StatusCode::NOT_FOUND, format!("unknown resource '{resource}'")),
    }
}

#[derive(Debug, Error)]
pub enum ListError {
    #[error(transparent)]
    Query(#[from] QueryParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs one list request: parses the grammar, then fetches the page and the
/// total together.
pub async fn query_resource(
    backend: &dyn Backend,
    def: &ResourceDef,
    pairs: Vec<(String, String)>,
    limits: PageLimits,
) -> Result<ListResponse<JsonValue>, ListError> {
    let mut query = ListQuery::from_pairs(pairs, def.page_limits(limits))?;
    if let Some(sort) = &def.default_sort {
        query = query.with_default_sort(sort)?;
    }

    let source = def.source(&query.args);
    let (data, total) = tokio::try_join!(backend.select(&source, &query), backend.count(&source, &query))
        .inspect_err(|err| warn!(resource = %def.name, source = %source, error = %err, "list query failed"))?;
    Ok(ListResponse {
        meta: PageMeta::new(&query, total),
        data,
    })
}

async fn list_resource(state: &AppState, def: &ResourceDef, pairs: Vec<(String, String)>) -> Response {
    match query_resource(state.backend.as_ref(), def, pairs, state.limits).await {
        Ok(page) => Json(page).into_response(),
        Err(ListError::Query(err)) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
        Err(ListError::Store(err)) => json_error(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

#[derive(Serialize)]
struct CompsBody<'a> {
    subject: Option<&'a SubjectFeatures>,
    comps: &'a [ComparableRow],
    points: Vec<MapPoint>,
}

#[derive(Debug, Default, Deserialize)]
struct CompsOptions {
    refresh: Option<String>,
}

/// `refresh=true` or `Cache-Control: no-cache` skips the cached result.
fn wants_fresh(options: &CompsOptions, headers: &HeaderMap) -> bool {
    let flagged = options
        .refresh
        .as_deref()
        .map(str::trim)
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let no_cache = headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"));
    flagged || no_cache
}

async fn comps_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Query(options): Query<CompsOptions>,
    Query(form): Query<CompForm>,
) -> Response {
    let parcel_id = parse_parcel_id(&id);
    let filters = form.to_filters();
    if let Some(parcel_id) = parcel_id.filter(|_| wants_fresh(&options, &headers)) {
        if state.comps.invalidate(parcel_id, &filters).await {
            debug!(parcel_id, "dropped cached comps on request");
        }
    }
    match state.comps.fetch(parcel_id, &filters).await {
        CompQueryState::Ready(result) => Json(CompsBody {
            subject: result.subject.as_ref(),
            comps: &result.comps,
            points: map_points(&result),
        })
        .into_response(),
        CompQueryState::Failed(message) => {
            warn!(parcel_id, error = %message, "comps request failed");
            json_error(StatusCode::BAD_GATEWAY, message)
        }
        CompQueryState::Idle => json_error(StatusCode::BAD_REQUEST, "Missing parcel id"),
    }
}
