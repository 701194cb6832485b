//! openrouteservice HTTP route estimator
//!
//! Preferred over OSRM when an API key is configured.

use super::{classify, http_client, RouteEstimator};
use crate::error::ProviderError;
use async_trait::async_trait;
use delayshield_core::{RouteMetrics, Waypoint};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

const DIRECTIONS_URL: &str = "https://api.openrouteservice.org/v2/directions/driving-car/geojson";

#[derive(Debug, Deserialize)]
struct Directions {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: Properties,
    geometry: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Properties {
    summary: Summary,
}

#[derive(Debug, Deserialize)]
struct Summary {
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    duration: f64,
}

/// Driving routes from the openrouteservice directions API
#[derive(Clone)]
pub struct OpenRouteEstimator {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    timeout: Duration,
}

impl std::fmt::Debug for OpenRouteEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouteEstimator")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl OpenRouteEstimator {
    /// Create estimator with an API key
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(ProviderError::NotConfigured("empty openrouteservice key".into()));
        }
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            endpoint: DIRECTIONS_URL.to_string(),
            timeout,
        })
    }

    /// Create estimator with the key stored in `path`
    pub fn from_key_file(path: &Path, timeout: Duration) -> Result<Self, ProviderError> {
        let key = std::fs::read_to_string(path).map_err(|e| {
            ProviderError::NotConfigured(format!("openrouteservice key {}: {e}", path.display()))
        })?;
        Self::new(key, timeout)
    }

    /// Point at another directions endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl RouteEstimator for OpenRouteEstimator {
    fn name(&self) -> &str {
        "ors"
    }

    async fn estimate(&self, waypoints: &[Waypoint]) -> Result<RouteMetrics, ProviderError> {
        if waypoints.len() < 2 {
            return Err(ProviderError::InvalidWaypoints(format!(
                "{} waypoints",
                waypoints.len()
            )));
        }
        let coordinates: Vec<[f64; 2]> = waypoints.iter().map(|w| [w.lon, w.lat]).collect();

        let body: Directions = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, &self.api_key)
            .json(&json!({ "coordinates": coordinates }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| classify(&e, self.timeout))?
            .json()
            .await
            .map_err(|e| classify(&e, self.timeout))?;

        parse_directions(body)
    }
}

fn parse_directions(body: Directions) -> Result<RouteMetrics, ProviderError> {
    let feature = body
        .features
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Decode("no features in response".to_string()))?;
    let Summary { distance, duration } = feature.properties.summary;
    if !(distance.is_finite() && duration.is_finite()) || distance < 0.0 || duration < 0.0 {
        return Err(ProviderError::Decode(format!(
            "bad route metrics {distance} m / {duration} s"
        )));
    }

    Ok(RouteMetrics {
        distance_m: distance.round() as u64,
        duration_s: duration.round() as u64,
        geometry: feature.geometry,
        provider: "ors".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(value: serde_json::Value) -> Directions {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_first_feature() {
        let metrics = parse_directions(body(json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"summary": {"distance": 585_990.6, "duration": 26_702.2}},
                "geometry": {"type": "LineString", "coordinates": [[-43.9, -19.9], [-46.6, -23.5]]}
            }]
        })))
        .unwrap();

        assert_eq!(metrics.distance_m, 585_991);
        assert_eq!(metrics.duration_s, 26_702);
        assert_eq!(metrics.geometry["type"], "LineString");
        assert_eq!(metrics.provider, "ors");
    }

    #[test]
    fn empty_features_is_decode_error() {
        let err = parse_directions(body(json!({"features": []}))).unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[test]
    fn key_file_is_trimmed() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  ors-key").unwrap();

        let ors = OpenRouteEstimator::from_key_file(file.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(ors.api_key, "ors-key");
        assert!(!format!("{ors:?}").contains("ors-key"));
    }

    #[test]
    fn missing_key_file_is_not_configured() {
        let err = OpenRouteEstimator::from_key_file(
            Path::new("/nonexistent/ors_key"),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }
}
