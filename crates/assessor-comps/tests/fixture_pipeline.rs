use std::path::Path;
use std::sync::Arc;

use assessor_comps::{map_points, normalize_result, CompDefaults, CompError, CompFetchClient, CompFilters, CompScorer};
use assessor_core::ComparableSearchRequest;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

fn fixture_rows() -> Vec<JsonValue> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/comps/parcel_1001.json");
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn fixture_normalizes_into_subject_and_ordered_comps() {
    let result = normalize_result(1001, &fixture_rows());

    let subject = result.subject.as_ref().unwrap();
    assert_eq!(subject.parcel_id, 1001);
    assert_eq!(subject.lat, Some(41.2565));
    assert_eq!(subject.postcode.as_deref(), Some("68131"));

    let ids = result.comps.iter().map(|c| c.parcel_id).collect::<Vec<_>>();
    assert_eq!(ids, vec![Some(2040), Some(2077), Some(2113), Some(2150)]);

    let first = &result.comps[0];
    assert_eq!(first.total_finished_area, Some(1790.0));
    assert!((first.price_per_sqft.unwrap() - 231000.0 / 1790.0).abs() < 1e-9);
    assert_eq!(first.sale_date_parsed().map(|d| d.to_string()).as_deref(), Some("2024-05-17"));

    let zero_area = &result.comps[1];
    assert_eq!(zero_area.sale_price, Some(189500.0));
    assert_eq!(zero_area.price_per_sqft, None);
    assert_eq!(zero_area.lat, Some(41.2502));

    let supplied = &result.comps[2];
    assert_eq!(supplied.price_per_sqft, Some(130.5));
    assert_eq!(supplied.lon, Some(-95.9298));
}

#[test]
fn fixture_points_put_subject_first_and_skip_unplaced_comps() {
    let result = normalize_result(1001, &fixture_rows());
    let points = map_points(&result);

    assert_eq!(points.len(), 4);
    assert!(points[0].is_subject);
    assert_eq!(points[0].label.as_deref(), Some("4410 Cass St"));
    let ids = points[1..].iter().map(|p| p.parcel_id).collect::<Vec<_>>();
    assert_eq!(ids, vec![Some(2040), Some(2077), Some(2113)]);
    assert_eq!(points[1].intensity, 1.0);
    assert_eq!(points[3].intensity, 0.0);
    assert!(points[1].radius > points[3].radius);
}

struct FixtureScorer;

#[async_trait]
impl CompScorer for FixtureScorer {
    async fn score(&self, _: &ComparableSearchRequest) -> Result<Vec<JsonValue>, CompError> {
        Ok(fixture_rows())
    }
}

#[tokio::test]
async fn fetch_client_serves_fixture() {
    let client = CompFetchClient::new(Arc::new(FixtureScorer), CompDefaults::default());
    let state = client.fetch(Some(1001), &CompFilters::default()).await;
    let data = state.data().unwrap();
    assert_eq!(data.comps.len(), 4);
    assert_eq!(client.cached_entries().await, 1);
}
