//! Cached comparable fetches and the apply-driven filter session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use assessor_core::{CompResult, ComparableSearchRequest};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::builder::{CompDefaults, CompFilters};
use crate::normalize::normalize_result;
use crate::scorer::CompScorer;
use crate::CompError;

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum CompQueryState {
    /// No parcel selected; nothing was requested.
    Idle,
    Ready(Arc<CompResult>),
    Failed(String),
}

impl CompQueryState {
    pub fn data(&self) -> Option<&Arc<CompResult>> {
        match self {
            CompQueryState::Ready(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            CompQueryState::Failed(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CompQueryState::Idle)
    }
}

type Slot = Arc<OnceCell<Arc<CompResult>>>;

#[derive(Default)]
struct CacheState {
    slots: HashMap<String, Slot>,
    order: VecDeque<String>,
}

/// Fetches comps through a [`CompScorer`], caching normalized results per
/// `(parcel, request)` key. Concurrent callers asking for the same key share
/// one upstream call. Failures are not cached.
pub struct CompFetchClient {
    scorer: Arc<dyn CompScorer>,
    defaults: CompDefaults,
    capacity: usize,
    cache: Mutex<CacheState>,
}

impl CompFetchClient {
    pub fn new(scorer: Arc<dyn CompScorer>, defaults: CompDefaults) -> Self {
        Self {
            scorer,
            defaults,
            capacity: DEFAULT_CACHE_CAPACITY,
            cache: Mutex::new(CacheState::default()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn request_for(&self, parcel_id: i64, filters: &CompFilters) -> ComparableSearchRequest {
        filters.to_request(parcel_id, &self.defaults)
    }

    pub async fn fetch(&self, parcel_id: Option<i64>, filters: &CompFilters) -> CompQueryState {
        let Some(parcel_id) = parcel_id else {
            return CompQueryState::Idle;
        };
        let request = self.request_for(parcel_id, filters);
        match self.fetch_request(&request).await {
            Ok(result) => CompQueryState::Ready(result),
            Err(err) => CompQueryState::Failed(err.to_string()),
        }
    }

    pub async fn fetch_request(&self, request: &ComparableSearchRequest) -> Result<Arc<CompResult>, CompError> {
        let slot = self.slot(request.cache_key()).await;
        if let Some(hit) = slot.get() {
            debug!(parcel_id = request.subject_parcel_id, "comps cache hit");
            return Ok(hit.clone());
        }
        let result = slot
            .get_or_try_init(|| async {
                debug!(parcel_id = request.subject_parcel_id, "fetching comps");
                let raw = self.scorer.score(request).await?;
                Ok::<_, CompError>(Arc::new(normalize_result(request.subject_parcel_id, &raw)))
            })
            .await?;
        Ok(result.clone())
    }

    /// Drops the cached result for these filters so the next fetch goes
    /// upstream. Returns whether an entry was present.
    pub async fn invalidate(&self, parcel_id: i64, filters: &CompFilters) -> bool {
        let key = self.request_for(parcel_id, filters).cache_key();
        let mut cache = self.cache.lock().await;
        cache.order.retain(|k| k != &key);
        cache.slots.remove(&key).is_some()
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.lock().await.slots.len()
    }

    async fn slot(&self, key: String) -> Slot {
        let mut cache = self.cache.lock().await;
        if let Some(slot) = cache.slots.get(&key) {
            return slot.clone();
        }
        while cache.slots.len() >= self.capacity {
            let Some(oldest) = cache.order.pop_front() else {
                break;
            };
            cache.slots.remove(&oldest);
        }
        let slot = Slot::default();
        cache.slots.insert(key.clone(), slot.clone());
        cache.order.push_back(key);
        slot
    }
}

/// Filter form state for one parcel: edits touch only the draft, and only
/// `apply` moves the draft into effect.
#[derive(Debug, Clone)]
pub struct CompSession {
    parcel_id: Option<i64>,
    draft: CompFilters,
    applied: CompFilters,
}

impl CompSession {
    pub fn new(parcel_id: Option<i64>, initial: CompFilters) -> Self {
        Self {
            parcel_id,
            draft: initial.clone(),
            applied: initial,
        }
    }

    pub fn parcel_id(&self) -> Option<i64> {
        self.parcel_id
    }

    pub fn draft(&self) -> &CompFilters {
        &self.draft
    }

    pub fn applied(&self) -> &CompFilters {
        &self.applied
    }

    pub fn edit(&mut self, change: impl FnOnce(&mut CompFilters)) {
        change(&mut self.draft);
    }

    pub fn is_dirty(&self) -> bool {
        self.draft != self.applied
    }

    pub fn reset(&mut self) {
        self.draft = self.applied.clone();
    }

    /// Current result for the applied filters, from cache when available.
    pub async fn current(&self, client: &CompFetchClient) -> CompQueryState {
        client.fetch(self.parcel_id, &self.applied).await
    }

    /// Commits the draft. A clean session reuses what is cached; a dirty one
    /// invalidates the newly applied key and fetches again.
    pub async fn apply(&mut self, client: &CompFetchClient) -> CompQueryState {
        if self.is_dirty() {
            self.applied = self.draft.clone();
            if let Some(parcel_id) = self.parcel_id {
                client.invalidate(parcel_id, &self.applied).await;
            }
        }
        client.fetch(self.parcel_id, &self.applied).await
    }

    /// Forces an upstream fetch for the applied filters.
    pub async fn refresh(&mut self, client: &CompFetchClient) -> CompQueryState {
        if let Some(parcel_id) = self.parcel_id {
            client.invalidate(parcel_id, &self.applied).await;
        }
        client.fetch(self.parcel_id, &self.applied).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::CompScorer;
    use assessor_storage::StoreError;
    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingScorer {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl CompScorer for CountingScorer {
        async fn score(&self, request: &ComparableSearchRequest) -> Result<Vec<JsonValue>, CompError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(CompError::Store(StoreError::Status {
                    status: 500,
                    message: "canceling statement due to statement timeout".into(),
                }));
            }
            Ok(vec![
                json!({ "parcel_id": request.subject_parcel_id, "lat": 41.0, "lon": -96.0 }),
                json!({ "comp_parcel_id": 99, "sale_price": 1000, "total_finished_area": 10 }),
            ])
        }
    }

    fn client(scorer: Arc<CountingScorer>) -> CompFetchClient {
        CompFetchClient::new(scorer, CompDefaults::default())
    }

    #[tokio::test]
    async fn no_parcel_means_idle_and_no_request() {
        let scorer = Arc::new(CountingScorer::default());
        let client = client(scorer.clone());
        let state = client.fetch(None, &CompFilters::default()).await;
        assert!(state.is_idle());
        assert!(state.data().is_none());
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_fetch_hits_cache() {
        let scorer = Arc::new(CountingScorer::default());
        let client = client(scorer.clone());
        let first = client.fetch(Some(5), &CompFilters::default()).await;
        let second = client.fetch(Some(5), &CompFilters::default()).await;
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
        let data = second.data().unwrap();
        assert!(Arc::ptr_eq(first.data().unwrap(), data));
        assert_eq!(data.comps[0].price_per_sqft, Some(100.0));
        assert_eq!(data.subject.as_ref().map(|s| s.parcel_id), Some(5));
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_call() {
        let scorer = Arc::new(CountingScorer::default());
        let client = client(scorer.clone());
        let filters = CompFilters::default();
        let (a, b) = tokio::join!(client.fetch(Some(5), &filters), client.fetch(Some(5), &filters));
        assert!(a.data().is_some() && b.data().is_some());
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_surface_message_and_are_not_cached() {
        let scorer = Arc::new(CountingScorer::default());
        scorer.fail.store(true, Ordering::SeqCst);
        let client = client(scorer.clone());
        let state = client.fetch(Some(5), &CompFilters::default()).await;
        assert_eq!(state.error(), Some("canceling statement due to statement timeout"));

        scorer.fail.store(false, Ordering::SeqCst);
        let state = client.fetch(Some(5), &CompFilters::default()).await;
        assert!(state.data().is_some());
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn edits_do_not_fetch_until_apply() {
        let scorer = Arc::new(CountingScorer::default());
        let client = client(scorer.clone());
        let mut session = CompSession::new(Some(5), CompFilters::default());
        session.current(&client).await;
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);

        session.edit(|f| f.max_distance_miles = Some(2.0));
        session.edit(|f| f.max_distance_miles = Some(2.5));
        assert!(session.is_dirty());
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);

        session.apply(&client).await;
        assert!(!session.is_dirty());
        assert_eq!(session.applied().max_distance_miles, Some(2.5));
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);

        // clean apply reuses the cached result
        session.apply(&client).await;
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);

        session.refresh(&client).await;
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reverting_an_edit_is_clean() {
        let mut session = CompSession::new(Some(5), CompFilters::default());
        session.edit(|f| f.require_same_land_use = Some(false));
        session.reset();
        assert!(!session.is_dirty());
    }

    #[tokio::test]
    async fn cache_evicts_oldest_beyond_capacity() {
        let scorer = Arc::new(CountingScorer::default());
        let client = client(scorer.clone()).with_capacity(2);
        for id in [1, 2, 3] {
            client.fetch(Some(id), &CompFilters::default()).await;
        }
        assert_eq!(client.cached_entries().await, 2);
        client.fetch(Some(1), &CompFilters::default()).await;
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 4);
    }
}
