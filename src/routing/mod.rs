//! Road-network routing.
//!
//! Every provider answers `route(from, to)` with a polyline, a length and an
//! estimated duration, or `None` when no route exists. Backend failures are
//! logged and reported as `None`; callers fall back to [`direct_route`].

mod cache;
mod graph;
mod http;

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::geo::{GeoPoint, haversine_meters};

pub use cache::CachedRouter;
pub use graph::RoadGraph;
pub use http::HttpRouter;

/// A computed route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub geometry: Vec<GeoPoint>,
    pub length_meters: f64,
    pub duration_seconds: f64,
}

/// Source of road routes.
pub trait RoutingProvider: Send + Sync {
    fn route(
        &self,
        from: GeoPoint,
        to: GeoPoint,
    ) -> impl Future<Output = Option<RouteResult>> + Send;
}

impl<T: RoutingProvider> RoutingProvider for Arc<T> {
    fn route(
        &self,
        from: GeoPoint,
        to: GeoPoint,
    ) -> impl Future<Output = Option<RouteResult>> + Send {
        (**self).route(from, to)
    }
}

/// Straight line between two points, timed at `speed_mps`.
pub fn direct_route(from: GeoPoint, to: GeoPoint, speed_mps: f64) -> RouteResult {
    let length_meters = haversine_meters(&from, &to);
    let duration_seconds = if speed_mps > 0.0 {
        length_meters / speed_mps
    } else {
        0.0
    };
    RouteResult {
        geometry: vec![from, to],
        length_meters,
        duration_seconds,
    }
}

/// Route via `provider`, falling back to a straight line when it has none.
///
/// The boolean is `true` when the fallback was used.
pub async fn route_or_direct<R: RoutingProvider>(
    provider: &R,
    from: GeoPoint,
    to: GeoPoint,
    fallback_speed_mps: f64,
) -> (RouteResult, bool) {
    match provider.route(from, to).await {
        Some(route) if route.geometry.len() >= 2 => (route, false),
        _ => (direct_route(from, to, fallback_speed_mps), true),
    }
}

/// The routing backend selected at start-up.
pub enum RoutingBackend {
    /// In-process shortest paths over a loaded road network.
    Graph(RoadGraph),
    /// External routing service.
    Http(HttpRouter),
    /// No road network; every query answers `None`.
    Direct,
}

impl RoutingProvider for RoutingBackend {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Option<RouteResult> {
        match self {
            RoutingBackend::Graph(graph) => graph.route(from, to).await,
            RoutingBackend::Http(http) => http.route(from, to).await,
            RoutingBackend::Direct => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LineString {
    #[serde(rename = "type")]
    kind: String,
    coordinates: Vec<[f64; 2]>,
}

/// Encode a polyline as a GeoJSON `LineString` (`[lon, lat]` pairs).
pub fn to_geojson(points: &[GeoPoint]) -> String {
    let line = LineString {
        kind: "LineString".to_string(),
        coordinates: points.iter().map(|p| [p.lon, p.lat]).collect(),
    };
    serde_json::to_string(&line).unwrap_or_default()
}

/// Decode a GeoJSON `LineString`. Returns `None` for anything else.
pub fn from_geojson(text: &str) -> Option<Vec<GeoPoint>> {
    let line: LineString = serde_json::from_str(text).ok()?;
    if line.kind != "LineString" {
        return None;
    }
    Some(
        line.coordinates
            .into_iter()
            .map(|[lon, lat]| GeoPoint::new(lat, lon))
            .collect(),
    )
}
