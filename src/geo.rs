//! Geographic helpers: distances, polyline walking and interpolation.
//!
//! All functions here are pure. Distances returned in meters use the
//! haversine formula; [`planar_distance`] works in raw degrees and is only
//! meant for relative ordering.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Meters per degree of latitude (flat-earth approximation).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Haversine distance to `other`, in meters.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        haversine_meters(self, other)
    }

    /// Linear interpolation in coordinate space; `t` is clamped to [0, 1].
    pub fn lerp(&self, other: &GeoPoint, t: f64) -> GeoPoint {
        let t = t.clamp(0.0, 1.0);
        GeoPoint {
            lat: self.lat + (other.lat - self.lat) * t,
            lon: self.lon + (other.lon - self.lon) * t,
        }
    }
}

/// Great-circle distance between two points, in meters.
pub fn haversine_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Euclidean distance in degrees. Only meaningful for sorting.
pub fn planar_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    planar_distance_squared(a, b).sqrt()
}

/// Squared Euclidean distance in degrees. Only meaningful for sorting.
pub fn planar_distance_squared(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let d_lat = b.lat - a.lat;
    let d_lon = b.lon - a.lon;
    d_lat * d_lat + d_lon * d_lon
}

/// Total length of a polyline, in meters.
pub fn polyline_length(points: &[GeoPoint]) -> f64 {
    points.windows(2).map(|w| haversine_meters(&w[0], &w[1])).sum()
}

/// Point reached after walking `distance` meters from the start of `points`.
///
/// Distances past either end clamp to the first or last vertex. Returns `None`
/// only for an empty polyline.
pub fn point_along(points: &[GeoPoint], distance: f64) -> Option<GeoPoint> {
    let first = *points.first()?;
    if distance <= 0.0 || points.len() == 1 {
        return Some(first);
    }
    if distance >= polyline_length(points) {
        return points.last().copied();
    }

    let mut walked = 0.0;
    for w in points.windows(2) {
        let segment = haversine_meters(&w[0], &w[1]);
        if walked + segment >= distance {
            if segment <= f64::EPSILON {
                return Some(w[1]);
            }
            return Some(w[0].lerp(&w[1], (distance - walked) / segment));
        }
        walked += segment;
    }

    points.last().copied()
}

/// Point at `percent` (0-100) of the polyline's length.
pub fn point_at_percent(points: &[GeoPoint], percent: f64) -> Option<GeoPoint> {
    let fraction = percent.clamp(0.0, 100.0) / 100.0;
    point_along(points, polyline_length(points) * fraction)
}

/// Shorten a polyline so that it ends `offset` meters before its last vertex.
///
/// The new last vertex is found by walking cumulative segment lengths and
/// interpolating inside the segment that covers the cut. Returns `None` when
/// the polyline is not longer than `offset`.
pub fn trim_end(points: &[GeoPoint], offset: f64) -> Option<Vec<GeoPoint>> {
    if offset <= 0.0 {
        return Some(points.to_vec());
    }
    let total = polyline_length(points);
    if points.len() < 2 || total <= offset {
        return None;
    }

    let target = total - offset;
    let mut trimmed = vec![points[0]];
    let mut walked = 0.0;
    for w in points.windows(2) {
        let segment = haversine_meters(&w[0], &w[1]);
        if walked + segment >= target {
            let t = if segment <= f64::EPSILON {
                1.0
            } else {
                (target - walked) / segment
            };
            trimmed.push(w[0].lerp(&w[1], t));
            return Some(trimmed);
        }
        trimmed.push(w[1]);
        walked += segment;
    }

    Some(trimmed)
}

/// Shift a point by a flat north/east displacement in meters.
pub fn offset_by_meters(point: &GeoPoint, north: f64, east: f64) -> GeoPoint {
    let cos_lat = point.lat.to_radians().cos().max(1e-6);
    GeoPoint {
        lat: point.lat + north / METERS_PER_DEGREE,
        lon: point.lon + east / (METERS_PER_DEGREE * cos_lat),
    }
}

/// Move from `from` towards `to` by at most `step` meters, never overshooting.
pub fn step_towards(from: &GeoPoint, to: &GeoPoint, step: f64) -> GeoPoint {
    let remaining = haversine_meters(from, to);
    if remaining <= step || remaining < 1e-6 {
        return *to;
    }
    from.lerp(to, step / remaining)
}
