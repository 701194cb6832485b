//! External route and weather providers
//!
//! Both are collaborators behind async traits. The worker owns retries,
//! timeouts and budget; implementations make exactly one upstream call per
//! invocation.

pub mod fixed;
pub mod openroute;
pub mod openweather;
pub mod osrm;

pub use fixed::FixedRouteEstimator;
pub use openroute::OpenRouteEstimator;
pub use openweather::OpenWeatherAdjuster;
pub use osrm::OsrmRouteEstimator;

use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use delayshield_core::{RouteMetrics, WeatherModifier, Waypoint};
use std::fmt::Debug;
use std::time::Duration;

/// Supplies route metrics for an ordered list of waypoints
#[async_trait]
pub trait RouteEstimator: Send + Sync + Debug {
    /// Provider name recorded with each route
    fn name(&self) -> &str;

    /// Estimate the route through `waypoints`, already clipped by the caller
    async fn estimate(&self, waypoints: &[Waypoint]) -> Result<RouteMetrics, ProviderError>;
}

/// Travel window a weather lookup covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Departure
    pub start: DateTime<Utc>,
    /// Expected arrival
    pub end: DateTime<Utc>,
}

/// Weather lookup result
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReport {
    pub modifier: WeatherModifier,
    /// Provider-specific details kept in the audit log
    pub details: serde_json::Value,
}

/// Supplies an optional risk modifier from forecast data
#[async_trait]
pub trait WeatherRiskAdjuster: Send + Sync + Debug {
    /// Forecast-based modifier for the trip during `window`
    async fn adjust(
        &self,
        waypoints: &[Waypoint],
        window: TimeWindow,
    ) -> Result<WeatherReport, ProviderError>;
}

/// Map a transport error to the provider taxonomy
pub(crate) fn classify(err: &reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        return ProviderError::Timeout {
            after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
    }
    match err.status().map(|s| s.as_u16()) {
        Some(429) => ProviderError::RateLimited,
        Some(400 | 404 | 422) => ProviderError::InvalidWaypoints(err.to_string()),
        _ if err.is_decode() => ProviderError::Decode(err.to_string()),
        _ => ProviderError::Upstream(err.to_string()),
    }
}

/// Build a client with a per-request timeout
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("delayshield/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("http client: {e}")))
}
