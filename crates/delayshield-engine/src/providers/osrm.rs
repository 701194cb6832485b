//! OSRM HTTP route estimator

use super::{classify, http_client, RouteEstimator};
use crate::error::ProviderError;
use async_trait::async_trait;
use delayshield_core::{RouteMetrics, Waypoint};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RouteResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
struct Route {
    distance: f64,
    duration: f64,
    geometry: serde_json::Value,
}

/// Driving routes from an OSRM server, GeoJSON geometry
#[derive(Debug, Clone)]
pub struct OsrmRouteEstimator {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OsrmRouteEstimator {
    /// Create estimator against `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, waypoints: &[Waypoint]) -> String {
        // OSRM takes lon,lat pairs
        let path = waypoints
            .iter()
            .map(|w| format!("{},{}", w.lon, w.lat))
            .collect::<Vec<_>>()
            .join(";");
        format!("{}/route/v1/driving/{path}", self.base_url)
    }
}

#[async_trait]
impl RouteEstimator for OsrmRouteEstimator {
    fn name(&self) -> &str {
        "osrm"
    }

    async fn estimate(&self, waypoints: &[Waypoint]) -> Result<RouteMetrics, ProviderError> {
        if waypoints.len() < 2 {
            return Err(ProviderError::InvalidWaypoints(format!(
                "{} waypoints",
                waypoints.len()
            )));
        }

        let response = self
            .client
            .get(self.url(waypoints))
            .query(&[("overview", "full"), ("geometries", "geojson")])
            .send()
            .await
            .map_err(|e| classify(&e, self.timeout))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ProviderError::Upstream(format!("osrm returned {status}")));
        }

        // OSRM reports bad input as 400 with a JSON body
        let body: RouteResponse = response
            .json()
            .await
            .map_err(|e| classify(&e, self.timeout))?;
        parse_route(body)
    }
}

fn parse_route(body: RouteResponse) -> Result<RouteMetrics, ProviderError> {
    match body.code.as_str() {
        "Ok" => {}
        "InvalidQuery" | "InvalidValue" | "InvalidCoordinate" | "NoRoute" | "NoSegment" => {
            return Err(ProviderError::InvalidWaypoints(
                body.message.unwrap_or(body.code),
            ));
        }
        "TooBig" => return Err(ProviderError::RateLimited),
        _ => {
            return Err(ProviderError::Upstream(
                body.message.unwrap_or(body.code),
            ))
        }
    }

    let route = body
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Decode("no routes in response".to_string()))?;
    if !(route.distance.is_finite() && route.duration.is_finite())
        || route.distance < 0.0
        || route.duration < 0.0
    {
        return Err(ProviderError::Decode(format!(
            "bad route metrics {} m / {} s",
            route.distance, route.duration
        )));
    }

    Ok(RouteMetrics {
        distance_m: route.distance.round() as u64,
        duration_s: route.duration.round() as u64,
        geometry: route.geometry,
        provider: "osrm".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> RouteResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn url_uses_lon_lat_order() {
        let osrm = OsrmRouteEstimator::new("http://osrm.local/", Duration::from_secs(5)).unwrap();
        let url = osrm.url(&[Waypoint::new(-19.9191, -43.9386), Waypoint::new(-23.5505, -46.6333)]);
        assert_eq!(
            url,
            "http://osrm.local/route/v1/driving/-43.9386,-19.9191;-46.6333,-23.5505"
        );
    }

    #[test]
    fn parses_first_route() {
        let metrics = parse_route(body(json!({
            "code": "Ok",
            "routes": [
                {"distance": 586012.4, "duration": 26699.6,
                 "geometry": {"type": "LineString", "coordinates": [[-43.9, -19.9], [-46.6, -23.5]]}},
                {"distance": 1.0, "duration": 1.0, "geometry": null}
            ]
        })))
        .unwrap();

        assert_eq!(metrics.distance_m, 586_012);
        assert_eq!(metrics.duration_s, 26_700);
        assert_eq!(metrics.geometry["type"], "LineString");
        assert_eq!(metrics.provider, "osrm");
    }

    #[test]
    fn no_route_is_invalid_waypoints() {
        let err = parse_route(body(json!({"code": "NoRoute", "message": "Impossible route"})))
            .unwrap_err();
        assert_eq!(err, ProviderError::InvalidWaypoints("Impossible route".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_routes_is_decode_error() {
        let err = parse_route(body(json!({"code": "Ok", "routes": []}))).unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }
}
