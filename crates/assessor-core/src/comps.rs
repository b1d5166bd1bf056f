//! Comparable-sale request and result shapes.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_DISTANCE_MILES: f64 = 1.0;
pub const DEFAULT_LIVING_AREA_BAND: f64 = 500.0;

/// Per-feature weights handed to the scoring function. Non-negativity is not
/// enforced; values pass through exactly as supplied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompWeights {
    pub land_use: f64,
    pub district: f64,
    pub lat: f64,
    pub lon: f64,
    pub condition: f64,
}

impl Default for CompWeights {
    fn default() -> Self {
        Self {
            land_use: 5.0,
            district: 4.0,
            lat: 3.0,
            lon: 3.0,
            condition: 3.0,
        }
    }
}

/// Weights as they arrive from a form: any member may be unset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PartialWeights {
    pub land_use: Option<f64>,
    pub district: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub condition: Option<f64>,
}

impl PartialWeights {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn resolve(&self, defaults: CompWeights) -> CompWeights {
        CompWeights {
            land_use: self.land_use.unwrap_or(defaults.land_use),
            district: self.district.unwrap_or(defaults.district),
            lat: self.lat.unwrap_or(defaults.lat),
            lon: self.lon.unwrap_or(defaults.lon),
            condition: self.condition.unwrap_or(defaults.condition),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableSearchRequest {
    pub subject_parcel_id: i64,
    pub max_distance_miles: f64,
    pub living_area_band: f64,
    pub require_same_land_use: bool,
    pub weights: CompWeights,
}

impl ComparableSearchRequest {
    /// Stable key for caching. Floats are keyed by bit pattern so `-0.0` and
    /// `0.0` are distinct, which matches what is sent upstream.
    pub fn cache_key(&self) -> String {
        let w = &self.weights;
        format!(
            "{}:{:x}:{:x}:{}:{:x}:{:x}:{:x}:{:x}:{:x}",
            self.subject_parcel_id,
            self.max_distance_miles.to_bits(),
            self.living_area_band.to_bits(),
            self.require_same_land_use,
            w.land_use.to_bits(),
            w.district.to_bits(),
            w.lat.to_bits(),
            w.lon.to_bits(),
            w.condition.to_bits(),
        )
    }
}

/// One candidate sale after alias resolution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComparableRow {
    pub parcel_id: Option<i64>,
    pub structure_count: Option<i64>,
    pub total_finished_area: Option<f64>,
    pub total_unfinished_area: Option<f64>,
    pub avg_year_built: Option<f64>,
    pub avg_condition: Option<f64>,
    pub sale_price: Option<f64>,
    pub sale_date: Option<String>,
    pub sale_type: Option<String>,
    pub price_per_sqft: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub district: Option<String>,
    pub land_use: Option<String>,
    pub house_number: Option<String>,
    pub street: Option<String>,
    pub postcode: Option<String>,
    pub comp_lot: Option<String>,
    pub comp_block: Option<String>,
    pub comp_ext: Option<String>,
    pub gower_distance: Option<f64>,
    pub distance_miles: Option<f64>,
}

impl ComparableRow {
    /// Calendar date of the sale. Accepts bare dates and timestamps.
    pub fn sale_date_parsed(&self) -> Option<NaiveDate> {
        let raw = self.sale_date.as_deref()?.trim();
        let date_part = raw.get(..10).unwrap_or(raw);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
    }

    pub fn address_line(&self) -> Option<String> {
        let parts = [self.house_number.as_deref(), self.street.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Features of the parcel the search was run for.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubjectFeatures {
    pub parcel_id: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub district: Option<String>,
    pub land_use: Option<String>,
    pub total_finished_area: Option<f64>,
    pub avg_year_built: Option<f64>,
    pub avg_condition: Option<f64>,
    pub house_number: Option<String>,
    pub street: Option<String>,
    pub postcode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompResult {
    pub subject: Option<SubjectFeatures>,
    pub comps: Vec<ComparableRow>,
}

/// A renderable marker. Styling values are derived from similarity outputs
/// and carry no ordering meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    pub parcel_id: Option<i64>,
    pub lat: f64,
    pub lon: f64,
    pub is_subject: bool,
    /// 0.0..=1.0, higher for more similar candidates.
    pub intensity: f64,
    pub radius: f64,
    pub label: Option<String>,
}
