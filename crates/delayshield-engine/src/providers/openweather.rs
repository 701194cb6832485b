//! OpenWeather 5-day forecast adjuster
//!
//! Looks up the forecast slot closest to the expected arrival at the
//! destination and folds rain, snow, wind and cloud cover into a severity
//! in [0, 1].

use super::{classify, http_client, TimeWindow, WeatherReport, WeatherRiskAdjuster};
use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use delayshield_core::{WeatherModifier, Waypoint};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

const FORECAST_URL: &str = "https://api.openweathermap.org/data/2.5/forecast";

#[derive(Debug, Default, Deserialize)]
struct Forecast {
    #[serde(default)]
    list: Vec<Slot>,
}

#[derive(Debug, Default, Deserialize)]
struct Slot {
    dt: i64,
    #[serde(default)]
    wind: Option<Wind>,
    #[serde(default)]
    rain: Option<Precipitation>,
    #[serde(default)]
    snow: Option<Precipitation>,
    #[serde(default)]
    clouds: Option<Clouds>,
}

#[derive(Debug, Default, Deserialize)]
struct Wind {
    #[serde(default)]
    speed: f64,
}

#[derive(Debug, Default, Deserialize)]
struct Precipitation {
    #[serde(rename = "3h", default)]
    three_hours: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct Clouds {
    #[serde(default)]
    all: f64,
}

/// Severity in [0, 1] from 3-hour rain and snow (mm), wind (m/s) and
/// cloud cover (%)
#[must_use]
pub fn severity(rain_mm: f64, snow_mm: f64, wind_mps: f64, clouds_pct: f64) -> f64 {
    let part = |value: f64, full: f64| (value.max(0.0) / full).min(1.0);
    let sev = part(rain_mm, 10.0) * 0.5
        + part(snow_mm, 5.0) * 0.6
        + part(wind_mps, 15.0) * 0.4
        + part(clouds_pct, 100.0) * 0.1;
    if sev.is_nan() {
        0.0
    } else {
        sev.clamp(0.0, 1.0)
    }
}

/// Weather modifier from the OpenWeather forecast API
#[derive(Clone)]
pub struct OpenWeatherAdjuster {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    timeout: Duration,
}

// Keeps the key out of logs
impl std::fmt::Debug for OpenWeatherAdjuster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenWeatherAdjuster")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl OpenWeatherAdjuster {
    /// Create adjuster with an API key
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(ProviderError::NotConfigured("empty openweather key".into()));
        }
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            endpoint: FORECAST_URL.to_string(),
            timeout,
        })
    }

    /// Create adjuster with the key stored in `path`
    pub fn from_key_file(path: &Path, timeout: Duration) -> Result<Self, ProviderError> {
        let key = std::fs::read_to_string(path).map_err(|e| {
            ProviderError::NotConfigured(format!("openweather key {}: {e}", path.display()))
        })?;
        Self::new(key, timeout)
    }

    /// Point at another forecast endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl WeatherRiskAdjuster for OpenWeatherAdjuster {
    async fn adjust(
        &self,
        waypoints: &[Waypoint],
        window: TimeWindow,
    ) -> Result<WeatherReport, ProviderError> {
        let destination = waypoints
            .last()
            .ok_or_else(|| ProviderError::InvalidWaypoints("no waypoints".into()))?;

        let forecast: Forecast = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("lat", destination.lat.to_string()),
                ("lon", destination.lon.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| classify(&e, self.timeout))?
            .json()
            .await
            .map_err(|e| classify(&e, self.timeout))?;

        Ok(report(&forecast, window.end))
    }
}

fn report(forecast: &Forecast, eta: DateTime<Utc>) -> WeatherReport {
    let eta_ts = eta.timestamp();
    let Some(slot) = forecast
        .list
        .iter()
        .min_by_key(|slot| (slot.dt - eta_ts).unsigned_abs())
    else {
        return WeatherReport {
            modifier: WeatherModifier::new(0.0),
            details: json!({"summary": "no-forecast", "severity": 0.0}),
        };
    };

    let wind = slot.wind.as_ref().map_or(0.0, |w| w.speed);
    let rain = slot.rain.as_ref().and_then(|p| p.three_hours).unwrap_or(0.0);
    let snow = slot.snow.as_ref().and_then(|p| p.three_hours).unwrap_or(0.0);
    let clouds = slot.clouds.as_ref().map_or(0.0, |c| c.all);
    let sev = severity(rain, snow, wind, clouds);

    WeatherReport {
        modifier: WeatherModifier::new(sev),
        details: json!({
            "severity": sev,
            "wind_mps": wind,
            "rain_3h_mm": rain,
            "snow_3h_mm": snow,
            "clouds_pct": clouds,
            "forecast_dt": DateTime::from_timestamp(slot.dt, 0).map(|at| at.to_rfc3339()),
        }),
    }
}
