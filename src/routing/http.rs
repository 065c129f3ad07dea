//! Client for an external routing service.
//!
//! `POST {base}/v1/routing/calculate` with `{from_lat, from_lon, to_lat,
//! to_lon}` answers `{route_geojson, route_length_meters,
//! estimated_duration_seconds}`, or 404 when the points are not connected.
//! Requests are bounded by a connect timeout and a whole-request timeout, so a
//! service that stops answering degrades to "no route".

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{RouteResult, RoutingProvider, from_geojson};
use crate::error::Result;
use crate::geo::GeoPoint;

#[derive(Debug, Serialize)]
struct CalculateRouteRequest {
    from_lat: f64,
    from_lon: f64,
    to_lat: f64,
    to_lon: f64,
}

#[derive(Debug, Deserialize)]
struct CalculateRouteResponse {
    route_geojson: String,
    route_length_meters: f64,
    estimated_duration_seconds: f64,
}

/// Routing provider backed by an HTTP service.
#[derive(Clone)]
pub struct HttpRouter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRouter {
    pub fn with_timeouts(base_url: &str, connect: Duration, request: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Query the service. `Ok(None)` means it reported no route.
    pub async fn calculate(&self, from: GeoPoint, to: GeoPoint) -> Result<Option<RouteResult>> {
        let url = format!("{}/v1/routing/calculate", self.base_url);
        let request = CalculateRouteRequest {
            from_lat: from.lat,
            from_lon: from.lon,
            to_lat: to.lat,
            to_lon: to.lon,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let data = response
            .error_for_status()?
            .json::<CalculateRouteResponse>()
            .await?;
        Ok(parse_response(data))
    }
}

fn parse_response(data: CalculateRouteResponse) -> Option<RouteResult> {
    if data.route_geojson.is_empty() || data.route_length_meters <= 0.0 {
        return None;
    }
    let geometry = from_geojson(&data.route_geojson)?;
    if geometry.len() < 2 {
        return None;
    }
    Some(RouteResult {
        geometry,
        length_meters: data.route_length_meters,
        duration_seconds: data.estimated_duration_seconds.max(0.0),
    })
}

impl RoutingProvider for HttpRouter {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Option<RouteResult> {
        match self.calculate(from, to).await {
            Ok(Some(route)) => Some(route),
            Ok(None) => {
                debug!(
                    from_lat = from.lat,
                    from_lon = from.lon,
                    to_lat = to.lat,
                    to_lon = to.lon,
                    "Routing service found no route"
                );
                None
            }
            Err(e) => {
                warn!(
                    from_lat = from.lat,
                    from_lon = from.lon,
                    to_lat = to.lat,
                    to_lon = to.lon,
                    error = %e,
                    "Routing service request failed"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let data = CalculateRouteResponse {
            route_geojson: r#"{"type":"LineString","coordinates":[[4.85,45.76],[4.86,45.77]]}"#
                .to_string(),
            route_length_meters: 1350.0,
            estimated_duration_seconds: 97.0,
        };
        let route = parse_response(data).unwrap();
        assert_eq!(route.geometry[0], GeoPoint::new(45.76, 4.85));
        assert_eq!(route.length_meters, 1350.0);
        assert_eq!(route.duration_seconds, 97.0);
    }

    #[test]
    fn test_empty_response_is_no_route() {
        let data = CalculateRouteResponse {
            route_geojson: String::new(),
            route_length_meters: 0.0,
            estimated_duration_seconds: 0.0,
        };
        assert!(parse_response(data).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_service_yields_none() {
        let router = HttpRouter::with_timeouts(
            "http://127.0.0.1:9",
            Duration::from_secs(1),
            Duration::from_secs(2),
        )
        .unwrap();
        let route = router
            .route(GeoPoint::new(45.76, 4.85), GeoPoint::new(45.77, 4.86))
            .await;
        assert!(route.is_none());
    }

    #[tokio::test]
    async fn test_silent_service_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept connections and hold them open without ever answering.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let router = HttpRouter::with_timeouts(
            &format!("http://{addr}"),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();
        let route = tokio::time::timeout(
            Duration::from_secs(5),
            router.route(GeoPoint::new(45.76, 4.85), GeoPoint::new(45.77, 4.86)),
        )
        .await;

        assert!(matches!(route, Ok(None)));
        server.abort();
    }
}
