//! Turns filter-form state into a comparable search request.

use assessor_core::{
    CompWeights, ComparableSearchRequest, PartialWeights, DEFAULT_LIVING_AREA_BAND,
    DEFAULT_MAX_DISTANCE_MILES,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompDefaults {
    pub max_distance_miles: f64,
    pub living_area_band: f64,
    pub require_same_land_use: bool,
    pub weights: CompWeights,
}

impl Default for CompDefaults {
    fn default() -> Self {
        Self {
            max_distance_miles: DEFAULT_MAX_DISTANCE_MILES,
            living_area_band: DEFAULT_LIVING_AREA_BAND,
            require_same_land_use: true,
            weights: CompWeights::default(),
        }
    }
}

/// Typed filter state. Unset members take their default when the request is
/// built; set members are sent as-is, including negative or out-of-range
/// values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompFilters {
    pub max_distance_miles: Option<f64>,
    pub living_area_band: Option<f64>,
    pub require_same_land_use: Option<bool>,
    #[serde(default)]
    pub weights: PartialWeights,
}

impl CompFilters {
    pub fn to_request(&self, parcel_id: i64, defaults: &CompDefaults) -> ComparableSearchRequest {
        ComparableSearchRequest {
            subject_parcel_id: parcel_id,
            max_distance_miles: self
                .max_distance_miles
                .unwrap_or(defaults.max_distance_miles),
            living_area_band: self.living_area_band.unwrap_or(defaults.living_area_band),
            require_same_land_use: self
                .require_same_land_use
                .unwrap_or(defaults.require_same_land_use),
            weights: self.weights.resolve(defaults.weights),
        }
    }
}

/// Raw form inputs as typed, e.g. straight from a query string.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompForm {
    pub max_distance_miles: Option<String>,
    pub living_area_band: Option<String>,
    pub same_land_use: Option<String>,
    pub w_land_use: Option<String>,
    pub w_district: Option<String>,
    pub w_lat: Option<String>,
    pub w_lon: Option<String>,
    pub w_condition: Option<String>,
}

impl CompForm {
    pub fn to_filters(&self) -> CompFilters {
        let num = |v: &Option<String>| v.as_deref().and_then(coerce_number);
        CompFilters {
            max_distance_miles: num(&self.max_distance_miles),
            living_area_band: num(&self.living_area_band),
            require_same_land_use: self.same_land_use.as_deref().and_then(coerce_bool),
            weights: PartialWeights {
                land_use: num(&self.w_land_use),
                district: num(&self.w_district),
                lat: num(&self.w_lat),
                lon: num(&self.w_lon),
                condition: num(&self.w_condition),
            },
        }
    }
}

/// Numeric coercion of a form input. Blank input is zero; anything that is
/// not a finite number is treated as not supplied.
pub fn coerce_number(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(0.0);
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn coerce_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Argument object for the `get_parcel_comps` procedure.
pub fn to_rpc_args(request: &ComparableSearchRequest) -> JsonValue {
    let w = &request.weights;
    json!({
        "p_parcel_id": request.subject_parcel_id,
        "p_max_distance_miles": request.max_distance_miles,
        "p_living_area_band": request.living_area_band,
        "p_same_land_use": request.require_same_land_use,
        "p_weights": {
            "land_use": w.land_use,
            "district": w.district,
            "lat": w.lat,
            "lon": w.lon,
            "condition": w.condition,
        },
    })
}
