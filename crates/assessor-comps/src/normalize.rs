//! Maps heterogeneous procedure output onto [`ComparableRow`].
//!
//! Each canonical field has an ordered list of source keys. The first key
//! holding a non-null value wins and is then coerced to the field's type; a
//! winner that cannot be coerced leaves the field empty.

use assessor_core::{CompResult, ComparableRow, SubjectFeatures};
use serde_json::{Map, Value as JsonValue};

/// Canonical field name to source keys, highest priority first.
pub const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("parcel_id", &["comp_parcel_id", "parcel_id"]),
    ("structure_count", &["structure_count", "comp_structure_count", "num_structures"]),
    (
        "total_finished_area",
        &["total_finished_area", "comp_total_finished_area", "living_area_total"],
    ),
    (
        "total_unfinished_area",
        &["total_unfinished_area", "comp_total_unfinished_area", "unfinished_area_total"],
    ),
    ("avg_year_built", &["avg_year_built", "comp_avg_year_built", "year_built"]),
    ("avg_condition", &["avg_condition", "comp_avg_condition", "condition"]),
    ("sale_price", &["sale_price", "comp_sale_price", "price"]),
    ("sale_date", &["sale_date", "comp_sale_date"]),
    ("sale_type", &["sale_type", "comp_sale_type"]),
    ("price_per_sqft", &["price_per_sqft", "comp_price_per_sqft"]),
    ("lat", &["lat", "comp_lat", "latitude"]),
    ("lon", &["lon", "comp_lon", "longitude", "lng"]),
    ("district", &["district", "comp_district"]),
    ("land_use", &["land_use", "comp_land_use"]),
    ("house_number", &["house_number", "comp_house_number"]),
    ("street", &["street", "comp_street"]),
    ("postcode", &["postcode", "comp_postcode", "zip"]),
    ("comp_lot", &["comp_lot", "lot"]),
    ("comp_block", &["comp_block", "block"]),
    ("comp_ext", &["comp_ext", "ext"]),
    ("gower_distance", &["gower_distance", "gower_dist"]),
    ("distance_miles", &["distance_miles", "dist_miles"]),
];

const SUBJECT_ID_KEY: &str = "subject_parcel_id";
const SUBJECT_FEATURES_KEY: &str = "subject_features";

fn aliases_for(field: &str) -> &'static [&'static str] {
    FIELD_ALIASES
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, aliases)| *aliases)
        .unwrap_or(&[])
}

fn first_non_null<'a>(obj: &'a Map<String, JsonValue>, field: &str) -> Option<&'a JsonValue> {
    aliases_for(field)
        .iter()
        .find_map(|key| obj.get(*key).filter(|v| !v.is_null()))
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

struct Fields<'a>(&'a Map<String, JsonValue>);

impl Fields<'_> {
    fn f64(&self, field: &str) -> Option<f64> {
        first_non_null(self.0, field).and_then(as_f64)
    }

    fn i64(&self, field: &str) -> Option<i64> {
        first_non_null(self.0, field).and_then(as_i64)
    }

    fn string(&self, field: &str) -> Option<String> {
        first_non_null(self.0, field).and_then(as_string)
    }
}

/// `sale_price / total_finished_area`, only when the area is a non-zero
/// number and a price exists.
pub fn derive_price_per_sqft(sale_price: Option<f64>, total_finished_area: Option<f64>) -> Option<f64> {
    match (sale_price, total_finished_area) {
        (Some(price), Some(area)) if area != 0.0 && !area.is_nan() => Some(price / area),
        _ => None,
    }
}

pub fn normalize_row(raw: &JsonValue) -> ComparableRow {
    let empty = Map::new();
    let obj = raw.as_object().unwrap_or(&empty);
    let f = Fields(obj);

    let sale_price = f.f64("sale_price");
    let total_finished_area = f.f64("total_finished_area");
    let price_per_sqft = f
        .f64("price_per_sqft")
        .or_else(|| derive_price_per_sqft(sale_price, total_finished_area));

    let mut row = ComparableRow {
        parcel_id: f.i64("parcel_id"),
        structure_count: f.i64("structure_count"),
        total_finished_area,
        total_unfinished_area: f.f64("total_unfinished_area"),
        avg_year_built: f.f64("avg_year_built"),
        avg_condition: f.f64("avg_condition"),
        sale_price,
        sale_date: f.string("sale_date"),
        sale_type: f.string("sale_type"),
        price_per_sqft,
        lat: f.f64("lat"),
        lon: f.f64("lon"),
        district: f.string("district"),
        land_use: f.string("land_use"),
        house_number: f.string("house_number"),
        street: f.string("street"),
        postcode: f.string("postcode"),
        comp_lot: f.string("comp_lot"),
        comp_block: f.string("comp_block"),
        comp_ext: f.string("comp_ext"),
        gower_distance: f.f64("gower_distance"),
        distance_miles: f.f64("distance_miles"),
    };
    // timestamps collapse to the calendar date; unreadable values stay as sent
    if let Some(date) = row.sale_date_parsed() {
        row.sale_date = Some(date.to_string());
    }
    row
}

fn subject_from_object(parcel_id: i64, obj: &Map<String, JsonValue>) -> SubjectFeatures {
    let f = Fields(obj);
    SubjectFeatures {
        parcel_id,
        lat: f.f64("lat"),
        lon: f.f64("lon"),
        district: f.string("district"),
        land_use: f.string("land_use"),
        total_finished_area: f.f64("total_finished_area"),
        avg_year_built: f.f64("avg_year_built"),
        avg_condition: f.f64("avg_condition"),
        house_number: f.string("house_number"),
        street: f.string("street"),
        postcode: f.string("postcode"),
    }
}

fn subject_from_row(parcel_id: i64, row: &ComparableRow) -> SubjectFeatures {
    SubjectFeatures {
        parcel_id,
        lat: row.lat,
        lon: row.lon,
        district: row.district.clone(),
        land_use: row.land_use.clone(),
        total_finished_area: row.total_finished_area,
        avg_year_built: row.avg_year_built,
        avg_condition: row.avg_condition,
        house_number: row.house_number.clone(),
        street: row.street.clone(),
        postcode: row.postcode.clone(),
    }
}

/// Index and features of the first row carrying a `subject_features` object
/// for `parcel_id`.
fn carried_subject(parcel_id: i64, raw_rows: &[JsonValue]) -> Option<(usize, SubjectFeatures)> {
    raw_rows.iter().enumerate().find_map(|(idx, raw)| {
        let obj = raw.as_object()?;
        let id = obj.get(SUBJECT_ID_KEY).and_then(as_i64)?;
        if id != parcel_id {
            return None;
        }
        let features = obj.get(SUBJECT_FEATURES_KEY)?.as_object()?;
        Some((idx, subject_from_object(parcel_id, features)))
    })
}

/// Splits procedure output into the subject and its candidates. Candidate
/// order is the order rows arrived in; nothing is re-sorted.
pub fn normalize_result(parcel_id: i64, raw_rows: &[JsonValue]) -> CompResult {
    let carried = carried_subject(parcel_id, raw_rows);
    let carrier_idx = carried.as_ref().map(|(idx, _)| *idx);
    let mut subject = carried.map(|(_, features)| features);
    let mut comps = Vec::with_capacity(raw_rows.len());

    for (idx, raw) in raw_rows.iter().enumerate() {
        let row = normalize_row(raw);
        if row.parcel_id == Some(parcel_id) {
            if subject.is_none() {
                subject = Some(subject_from_row(parcel_id, &row));
            }
            continue;
        }
        if Some(idx) == carrier_idx && row.parcel_id.is_none() {
            continue;
        }
        comps.push(row);
    }

    CompResult { subject, comps }
}
