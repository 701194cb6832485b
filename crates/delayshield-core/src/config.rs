//! Engine configuration
//!
//! Loaded in three layers: built-in defaults, an optional TOML file, then
//! environment overrides. Every table is `#[serde(default)]`, so a file only
//! needs the keys it changes:
//!
//! ```toml
//! [budgets.route]
//! daily = 200
//!
//! [schedule.balanced]
//! red_min = 3
//! ```

use crate::clock::seconds;
use crate::error::ConfigError;
use crate::types::{PolicyMode, Provider, StatusBand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global provider caps
    pub budgets: BudgetConfig,
    /// Values applied to new trips
    pub trip_defaults: TripDefaults,
    /// Risk policy table
    pub risk: RiskConfig,
    /// Recalculation cadence
    pub schedule: ScheduleConfig,
    /// Worker pool and retry tuning
    pub worker: WorkerConfig,
    /// External provider endpoints
    pub providers: ProviderConfig,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, then `path` if given, then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!(?path, "configuration loaded");
        Ok(config)
    }

    /// Apply overrides looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("ROUTE_DAILY_LIMIT") {
            self.budgets.route.daily = parse("ROUTE_DAILY_LIMIT", v)?;
        }
        if let Some(v) = lookup("ROUTE_PER_MIN_LIMIT") {
            self.budgets.route.per_minute = parse("ROUTE_PER_MIN_LIMIT", v)?;
        }
        if let Some(v) = lookup("OWM_DAILY_LIMIT") {
            self.budgets.weather.daily = parse("OWM_DAILY_LIMIT", v)?;
        }
        if let Some(v) = lookup("OWM_PER_MIN_LIMIT") {
            self.budgets.weather.per_minute = parse("OWM_PER_MIN_LIMIT", v)?;
        }
        if let Some(v) = lookup("SCAN_INTERVAL_SECONDS") {
            self.schedule.scan_interval_secs = parse("SCAN_INTERVAL_SECONDS", v)?;
        }
        if let Some(v) = lookup("OSRM_BASE_URL") {
            self.providers.osrm_base_url = v;
        }
        if let Some(v) = lookup("OPENROUTESERVICE_API_KEY_FILE") {
            self.providers.openrouteservice_api_key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("OPENWEATHER_API_KEY_FILE") {
            self.providers.openweather_api_key_file = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for mode in PolicyMode::ALL {
            let p = self.risk.params(mode);
            if !(0 < p.yellow_at && p.yellow_at < p.red_at && p.red_at <= 100) {
                return invalid(format!(
                    "risk.{mode}: need 0 < yellow_at < red_at <= 100, got {} / {}",
                    p.yellow_at, p.red_at
                ));
            }
            if !(p.slope_min.is_finite() && p.slope_min > 0.0) {
                return invalid(format!("risk.{mode}.slope_min must be positive"));
            }
            if p.safety_margin_min < 0 {
                return invalid(format!("risk.{mode}.safety_margin_min must not be negative"));
            }

            let i = self.schedule.intervals(mode);
            if !(0 < i.red_min && i.red_min <= i.yellow_min && i.yellow_min <= i.green_min) {
                return invalid(format!(
                    "schedule.{mode}: need 0 < red_min <= yellow_min <= green_min"
                ));
            }
        }

        let (c, b, a) = (
            &self.risk.conservative,
            &self.risk.balanced,
            &self.risk.aggressive,
        );
        if !(c.safety_margin_min >= b.safety_margin_min
            && b.safety_margin_min >= a.safety_margin_min)
        {
            return invalid("risk: safety margins must be conservative >= balanced >= aggressive".into());
        }
        if !(c.slope_min <= b.slope_min && b.slope_min <= a.slope_min) {
            return invalid("risk: slope_min must be conservative <= balanced <= aggressive".into());
        }
        if !(self.risk.weather_weight.is_finite() && self.risk.weather_weight >= 0.0) {
            return invalid("risk.weather_weight must be non-negative".into());
        }
        if self.worker.concurrency == 0 || self.worker.max_attempts == 0 {
            return invalid("worker.concurrency and worker.max_attempts must be positive".into());
        }
        if self.worker.job_timeout_secs == 0 || self.worker.provider_timeout_secs == 0 {
            return invalid("worker timeouts must be positive".into());
        }
        if self.providers.max_route_waypoints < 2 {
            return invalid("providers.max_route_waypoints must be at least 2".into());
        }
        if self.trip_defaults.route_daily_cap == 0 || self.trip_defaults.weather_daily_cap == 0 {
            return invalid("trip_defaults caps must be positive".into());
        }
        Ok(())
    }
}

/// Global caps for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Calls per UTC day
    pub daily: u64,
    /// Calls per minute
    pub per_minute: u64,
}

/// Global caps per provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub route: ProviderLimits,
    pub weather: ProviderLimits,
}

impl BudgetConfig {
    /// Limits for `provider`
    #[inline]
    #[must_use]
    pub fn limits(&self, provider: Provider) -> ProviderLimits {
        match provider {
            Provider::Route => self.route,
            Provider::Weather => self.weather,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            route: ProviderLimits {
                daily: 400,
                per_minute: 20,
            },
            weather: ProviderLimits {
                daily: 800,
                per_minute: 30,
            },
        }
    }
}

/// Defaults for new trips
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripDefaults {
    pub policy_mode: PolicyMode,
    pub route_daily_cap: u32,
    pub weather_daily_cap: u32,
}

impl Default for TripDefaults {
    fn default() -> Self {
        Self {
            policy_mode: PolicyMode::Balanced,
            route_daily_cap: 15,
            weather_daily_cap: 30,
        }
    }
}

/// Risk parameters for one policy mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyParams {
    /// Minutes added to the route duration before comparing with the deadline
    pub safety_margin_min: i64,
    /// Buffer minutes per e-fold of the risk curve; smaller is steeper
    pub slope_min: f64,
    /// Risk at or above this is at least yellow
    pub yellow_at: u8,
    /// Risk at or above this is red
    pub red_at: u8,
}

/// Policy table and weather weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Risk points added at weather severity 1.0
    pub weather_weight: f64,
    pub conservative: PolicyParams,
    pub balanced: PolicyParams,
    pub aggressive: PolicyParams,
}

impl RiskConfig {
    /// Parameters for `mode`
    #[inline]
    #[must_use]
    pub fn params(&self, mode: PolicyMode) -> &PolicyParams {
        match mode {
            PolicyMode::Conservative => &self.conservative,
            PolicyMode::Balanced => &self.balanced,
            PolicyMode::Aggressive => &self.aggressive,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weather_weight: 25.0,
            conservative: PolicyParams {
                safety_margin_min: 45,
                slope_min: 45.0,
                yellow_at: 30,
                red_at: 60,
            },
            balanced: PolicyParams {
                safety_margin_min: 20,
                slope_min: 60.0,
                yellow_at: 34,
                red_at: 67,
            },
            aggressive: PolicyParams {
                safety_margin_min: 10,
                slope_min: 90.0,
                yellow_at: 40,
                red_at: 75,
            },
        }
    }
}

/// Minutes until the next run, by current band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandIntervals {
    pub green_min: u32,
    pub yellow_min: u32,
    pub red_min: u32,
}

impl BandIntervals {
    /// Interval for `band`
    #[inline]
    #[must_use]
    pub fn for_band(&self, band: StatusBand) -> chrono::Duration {
        let minutes = match band {
            StatusBand::Green => self.green_min,
            StatusBand::Yellow => self.yellow_min,
            StatusBand::Red => self.red_min,
        };
        chrono::Duration::minutes(i64::from(minutes))
    }
}

/// Recalculation cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between due scans
    pub scan_interval_secs: u64,
    /// Max trips enqueued per scan
    pub scan_batch: usize,
    /// Delay before retrying a budget-limited trip
    pub budget_retry_secs: u64,
    /// First retry delay after a failed run
    pub error_backoff_base_secs: u64,
    /// Ceiling for the failed-run retry delay
    pub error_backoff_max_secs: u64,
    pub conservative: BandIntervals,
    pub balanced: BandIntervals,
    pub aggressive: BandIntervals,
}

impl ScheduleConfig {
    /// Interval table for `mode`
    #[inline]
    #[must_use]
    pub fn intervals(&self, mode: PolicyMode) -> &BandIntervals {
        match mode {
            PolicyMode::Conservative => &self.conservative,
            PolicyMode::Balanced => &self.balanced,
            PolicyMode::Aggressive => &self.aggressive,
        }
    }

    /// Delay after the `failures`-th consecutive failed run
    #[must_use]
    pub fn error_backoff(&self, failures: u32) -> chrono::Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let secs = self
            .error_backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.error_backoff_max_secs);
        seconds(secs)
    }

    /// Delay before retrying a budget-limited trip
    #[inline]
    #[must_use]
    pub fn budget_retry(&self) -> chrono::Duration {
        seconds(self.budget_retry_secs)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            scan_batch: 50,
            budget_retry_secs: 600,
            error_backoff_base_secs: 300,
            error_backoff_max_secs: 3600,
            conservative: BandIntervals {
                green_min: 60,
                yellow_min: 25,
                red_min: 8,
            },
            balanced: BandIntervals {
                green_min: 40,
                yellow_min: 15,
                red_min: 5,
            },
            aggressive: BandIntervals {
                green_min: 20,
                yellow_min: 8,
                red_min: 2,
            },
        }
    }
}

/// Worker pool and retry tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Parallel workers
    pub concurrency: usize,
    /// Route provider attempts per job, first call included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Per-call timeout
    pub provider_timeout_secs: u64,
    /// Hard bound on one job's wall-clock time
    pub job_timeout_secs: u64,
    /// Extra slack before the watchdog forces a stuck job
    pub watchdog_grace_secs: u64,
    pub watchdog_interval_secs: u64,
}

impl WorkerConfig {
    /// Sleep before retry number `retry` (1-based)
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.max(1) - 1).unwrap_or(i32::MAX);
        let raw = (self.initial_backoff_ms as f64) * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }

    #[inline]
    #[must_use]
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Age after which a running or queued trip is considered stuck
    #[inline]
    #[must_use]
    pub fn stuck_after(&self) -> chrono::Duration {
        seconds(self.job_timeout_secs.saturating_add(self.watchdog_grace_secs))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8_000,
            provider_timeout_secs: 25,
            job_timeout_secs: 120,
            watchdog_grace_secs: 30,
            watchdog_interval_secs: 30,
        }
    }
}

/// External provider endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub osrm_base_url: String,
    /// File holding the openrouteservice API key; routes use OSRM without it
    pub openrouteservice_api_key_file: Option<PathBuf>,
    /// File holding the OpenWeather API key; weather is skipped without it
    pub openweather_api_key_file: Option<PathBuf>,
    /// Route requests are clipped to this many waypoints
    pub max_route_waypoints: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            osrm_base_url: "https://router.project-osrm.org".to_string(),
            openrouteservice_api_key_file: None,
            openweather_api_key_file: None,
            max_route_waypoints: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let raw = r#"
            [budgets.route]
            daily = 10
            per_minute = 2

            [schedule.balanced]
            green_min = 30
            yellow_min = 10
            red_min = 3
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.budgets.route.daily, 10);
        assert_eq!(config.budgets.weather, BudgetConfig::default().weather);
        assert_eq!(config.schedule.balanced.red_min, 3);
        assert_eq!(config.worker, WorkerConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nconcurrency = 8").unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.worker.concurrency, 8);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("ROUTE_DAILY_LIMIT", "7"),
            ("OWM_PER_MIN_LIMIT", "3"),
            ("OSRM_BASE_URL", "http://localhost:5000"),
            ("OPENROUTESERVICE_API_KEY_FILE", "/run/secrets/ors"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.budgets.route.daily, 7);
        assert_eq!(config.budgets.weather.per_minute, 3);
        assert_eq!(config.providers.osrm_base_url, "http://localhost:5000");
        assert_eq!(
            config.providers.openrouteservice_api_key_file,
            Some(PathBuf::from("/run/secrets/ors"))
        );
    }

    #[test]
    fn bad_env_override_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(|k| (k == "ROUTE_DAILY_LIMIT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = EngineConfig::default();
        config.risk.balanced.yellow_at = 80;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn conservative_curve_must_be_steepest() {
        let mut config = EngineConfig::default();
        config.risk.conservative.slope_min = 75.0;
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("slope_min")),
            other => panic!("expected invalid config, got {other:?}"),
        }

        config.risk.conservative.slope_min = 60.0;
        assert!(config.validate().is_ok(), "equal slopes are allowed");
    }

    #[test]
    fn red_interval_must_not_exceed_green() {
        let mut config = EngineConfig::default();
        config.schedule.aggressive.red_min = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn error_backoff_doubles_and_caps() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.error_backoff(1), chrono::Duration::seconds(300));
        assert_eq!(schedule.error_backoff(2), chrono::Duration::seconds(600));
        assert_eq!(schedule.error_backoff(10), chrono::Duration::seconds(3600));
    }

    #[test]
    fn worker_backoff_is_exponential() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.backoff(1), Duration::from_millis(500));
        assert_eq!(worker.backoff(2), Duration::from_millis(1000));
        assert_eq!(worker.backoff(10), Duration::from_millis(8000));
    }
}
