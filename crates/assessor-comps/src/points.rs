use assessor_core::{CompResult, MapPoint};

pub const SUBJECT_RADIUS: f64 = 10.0;
pub const MAX_COMP_RADIUS: f64 = 9.0;
pub const MIN_COMP_RADIUS: f64 = 4.0;

/// Marker list for the map. The subject, when it has coordinates, is always
/// first; candidates without coordinates are skipped.
pub fn map_points(result: &CompResult) -> Vec<MapPoint> {
    let mut points = Vec::with_capacity(result.comps.len() + 1);

    if let Some(subject) = &result.subject {
        if let (Some(lat), Some(lon)) = (subject.lat, subject.lon) {
            let label = [subject.house_number.as_deref(), subject.street.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            points.push(MapPoint {
                parcel_id: Some(subject.parcel_id),
                lat,
                lon,
                is_subject: true,
                intensity: 1.0,
                radius: SUBJECT_RADIUS,
                label: Some(if label.is_empty() { "Subject".to_string() } else { label }),
            });
        }
    }

    let gower = result.comps.iter().filter_map(|c| c.gower_distance);
    let g_min = gower.clone().fold(f64::INFINITY, f64::min);
    let g_max = gower.fold(f64::NEG_INFINITY, f64::max);
    let d_max = result
        .comps
        .iter()
        .filter_map(|c| c.distance_miles)
        .fold(0.0_f64, f64::max);

    for comp in &result.comps {
        let (Some(lat), Some(lon)) = (comp.lat, comp.lon) else {
            continue;
        };
        points.push(MapPoint {
            parcel_id: comp.parcel_id,
            lat,
            lon,
            is_subject: false,
            intensity: comp
                .gower_distance
                .map(|g| scaled_intensity(g, g_min, g_max))
                .unwrap_or(0.0),
            radius: comp
                .distance_miles
                .map(|d| scaled_radius(d, d_max))
                .unwrap_or(MIN_COMP_RADIUS),
            label: comp.address_line(),
        });
    }

    points
}

fn scaled_intensity(g: f64, min: f64, max: f64) -> f64 {
    let span = max - min;
    if !span.is_finite() || span <= f64::EPSILON {
        return 1.0;
    }
    (1.0 - (g - min) / span).clamp(0.0, 1.0)
}

fn scaled_radius(d: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return MAX_COMP_RADIUS;
    }
    let t = (d / max).clamp(0.0, 1.0);
    MAX_COMP_RADIUS - (MAX_COMP_RADIUS - MIN_COMP_RADIUS) * t
}
