//! Offline route estimator with static metrics

use super::RouteEstimator;
use crate::error::ProviderError;
use async_trait::async_trait;
use delayshield_core::{RouteMetrics, Waypoint};
use serde_json::json;

/// Returns the same distance and duration for every route.
/// Geometry is the straight polyline through the waypoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRouteEstimator {
    distance_m: u64,
    duration_s: u64,
}

impl FixedRouteEstimator {
    #[inline]
    #[must_use]
    pub const fn new(distance_m: u64, duration_s: u64) -> Self {
        Self {
            distance_m,
            duration_s,
        }
    }
}

#[async_trait]
impl RouteEstimator for FixedRouteEstimator {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn estimate(&self, waypoints: &[Waypoint]) -> Result<RouteMetrics, ProviderError> {
        if waypoints.len() < 2 {
            return Err(ProviderError::InvalidWaypoints(format!(
                "{} waypoints",
                waypoints.len()
            )));
        }
        let coordinates: Vec<[f64; 2]> = waypoints.iter().map(|w| [w.lon, w.lat]).collect();
        Ok(RouteMetrics {
            distance_m: self.distance_m,
            duration_s: self.duration_s,
            geometry: json!({"type": "LineString", "coordinates": coordinates}),
            provider: self.name().to_string(),
        })
    }
}
