//! Delay risk scoring
//!
//! A pure function of route duration, deadline, "now", an optional weather
//! modifier and the policy mode. Risk follows a logistic curve over the
//! buffer (deadline minus ETA):
//!
//! ```text
//! risk = 100 / (1 + e^(buffer_min / slope_min)) + weather_points
//! ```
//!
//! so it is 50 at zero buffer, tends to 100 when late and to 0 with a large
//! buffer. A smaller `slope_min` (conservative) makes the curve steeper.

use crate::clock::seconds;
use crate::config::{PolicyParams, RiskConfig};
use crate::types::{PolicyMode, StatusBand};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Weather-derived risk modifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherModifier {
    /// Severity in [0, 1]; out-of-range values are clamped
    pub severity: f64,
}

impl WeatherModifier {
    /// Create new modifier
    #[inline]
    #[must_use]
    pub fn new(severity: f64) -> Self {
        Self { severity }
    }

    /// Clamped severity, NaN treated as calm
    #[inline]
    #[must_use]
    pub fn clamped(&self) -> f64 {
        if self.severity.is_nan() {
            0.0
        } else {
            self.severity.clamp(0.0, 1.0)
        }
    }
}

/// Everything the scorer looks at
#[derive(Debug, Clone, PartialEq)]
pub struct RiskInputs {
    pub route_duration_s: u64,
    pub route_distance_m: u64,
    pub deadline_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub weather: Option<WeatherModifier>,
    pub policy_mode: PolicyMode,
}

/// Scorer output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub eta_at: DateTime<Utc>,
    /// Signed minutes, deadline minus ETA
    pub buffer_minutes: i64,
    /// In [0, 100]
    pub delay_risk_pct: u8,
    pub status: StatusBand,
    pub suggestion: String,
    /// Only set when status is above green
    pub recommended_depart_at: Option<DateTime<Utc>>,
    /// Short machine-friendly explanation
    pub why: String,
}

/// Maps route metrics and policy to a risk assessment
#[derive(Debug, Clone, Default)]
pub struct RiskScorer {
    config: RiskConfig,
}

impl RiskScorer {
    /// Create scorer from a policy table
    #[inline]
    #[must_use]
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Policy table in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Score one trip. Identical inputs give identical outputs.
    #[must_use]
    pub fn score(&self, inputs: &RiskInputs) -> RiskAssessment {
        let params = self.config.params(inputs.policy_mode);
        let travel = seconds(inputs.route_duration_s);
        let margin = Duration::minutes(params.safety_margin_min);

        let eta_at = inputs.now + travel + margin;
        let buffer_minutes = round_minutes(inputs.deadline_at - eta_at);

        let severity = inputs.weather.map_or(0.0, |w| w.clamped());
        let delay_risk_pct = self.risk_pct(buffer_minutes, params, severity);
        let status = band(delay_risk_pct, params);

        let recommended_depart_at =
            (status != StatusBand::Green).then(|| inputs.deadline_at - travel - margin);

        RiskAssessment {
            eta_at,
            buffer_minutes,
            delay_risk_pct,
            status,
            suggestion: suggestion(status).to_string(),
            recommended_depart_at,
            why: format!("buffer={buffer_minutes}min, weather_sev={severity:.2}"),
        }
    }

    /// Risk for a buffer under `mode`, no weather
    #[must_use]
    pub fn risk_for_buffer(&self, buffer_minutes: i64, mode: PolicyMode) -> u8 {
        self.risk_pct(buffer_minutes, self.config.params(mode), 0.0)
    }

    /// Status band for a risk percentage under `mode`
    #[must_use]
    pub fn status_for(&self, delay_risk_pct: u8, mode: PolicyMode) -> StatusBand {
        band(delay_risk_pct, self.config.params(mode))
    }

    fn risk_pct(&self, buffer_minutes: i64, params: &PolicyParams, severity: f64) -> u8 {
        let base = 100.0 / (1.0 + (buffer_minutes as f64 / params.slope_min).exp());
        let raw = base + severity * self.config.weather_weight;
        raw.round().clamp(0.0, 100.0) as u8
    }
}

/// Status from the two ordered thresholds of a policy
fn band(delay_risk_pct: u8, params: &PolicyParams) -> StatusBand {
    if delay_risk_pct >= params.red_at {
        StatusBand::Red
    } else if delay_risk_pct >= params.yellow_at {
        StatusBand::Yellow
    } else {
        StatusBand::Green
    }
}

fn round_minutes(d: Duration) -> i64 {
    let secs = d.num_seconds();
    // round half away from zero
    if secs >= 0 {
        (secs + 30) / 60
    } else {
        (secs - 30) / 60
    }
}

/// Operator guidance per band
#[must_use]
pub fn suggestion(status: StatusBand) -> &'static str {
    match status {
        StatusBand::Green => "Keep the current route. Recalculate closer to the deadline.",
        StatusBand::Yellow => {
            "Consider leaving earlier and warn the customer about a possible delay."
        }
        StatusBand::Red => "HIGH risk: leave now or switch route, and ALERT the customer.",
    }
}

/// Customer-facing one-line update
#[must_use]
pub fn customer_message(assessment: &RiskAssessment, deadline_at: DateTime<Utc>) -> String {
    format!(
        "Update: status {} {}. ETA {} (deadline {}). Reason: {}. Action: {}",
        assessment.status.symbol(),
        assessment.status,
        assessment.eta_at.format("%Y-%m-%d %H:%M UTC"),
        deadline_at.format("%Y-%m-%d %H:%M UTC"),
        assessment.why,
        assessment.suggestion,
    )
}
