//! Core types for DelayShield
//!
//! Defines the fundamental records of the recalculation engine:
//! - Trip identity, waypoints and policy
//! - Severity bands and calc states
//! - Audit log entries
//! - Usage counter keys for provider budgets

use crate::error::ValidationError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique trip identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(pub Uuid);

impl TripId {
    /// Generate new trip ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TripId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TripId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A point on the route, WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Latitude in degrees, [-90, 90]
    pub lat: f64,
    /// Longitude in degrees, [-180, 180]
    pub lon: f64,
}

impl Waypoint {
    /// Create new waypoint
    #[inline]
    #[must_use]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Finite and inside the coordinate ranges
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Parses `"lat,lon"`
impl FromStr for Waypoint {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::UnparsableWaypoint(s.to_string());
        let (lat, lon) = s.split_once(',').ok_or_else(invalid)?;
        let lat = lat.trim().parse::<f64>().map_err(|_| invalid())?;
        let lon = lon.trim().parse::<f64>().map_err(|_| invalid())?;
        Ok(Self::new(lat, lon))
    }
}

/// Named parameter set controlling safety margin and risk slope
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Widest margin, steepest risk curve
    Conservative,
    /// Default trade-off
    #[default]
    Balanced,
    /// Narrow margin, flattest risk curve
    Aggressive,
}

impl PolicyMode {
    /// All modes, most cautious first
    pub const ALL: [PolicyMode; 3] = [
        PolicyMode::Conservative,
        PolicyMode::Balanced,
        PolicyMode::Aggressive,
    ];

    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::Conservative => "conservative",
            PolicyMode::Balanced => "balanced",
            PolicyMode::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(PolicyMode::Conservative),
            "balanced" => Ok(PolicyMode::Balanced),
            "aggressive" => Ok(PolicyMode::Aggressive),
            other => Err(ValidationError::UnknownPolicyMode(other.to_string())),
        }
    }
}

/// Ordered severity band derived from delay risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusBand {
    /// Lowest severity
    Green,
    /// Middle severity
    Yellow,
    /// Highest severity
    Red,
}

impl StatusBand {
    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusBand::Green => "green",
            StatusBand::Yellow => "yellow",
            StatusBand::Red => "red",
        }
    }

    /// Display symbol used in customer-facing messages
    #[inline]
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            StatusBand::Green => "🟢",
            StatusBand::Yellow => "🟡",
            StatusBand::Red => "🔴",
        }
    }
}

impl fmt::Display for StatusBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a trip's current or most recent recomputation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcState {
    /// Never scheduled
    #[default]
    Idle,
    /// Job enqueued, not yet picked up
    Queued,
    /// A worker holds the trip
    Running,
    /// Last job succeeded
    Done,
    /// Last job exhausted provider retries or timed out
    Error,
    /// Last job was denied route budget
    BudgetLimited,
}

impl CalcState {
    /// All states
    pub const ALL: [CalcState; 6] = [
        CalcState::Idle,
        CalcState::Queued,
        CalcState::Running,
        CalcState::Done,
        CalcState::Error,
        CalcState::BudgetLimited,
    ];

    /// States from which a new job may be enqueued
    pub const SCHEDULABLE: [CalcState; 4] = [
        CalcState::Idle,
        CalcState::Done,
        CalcState::Error,
        CalcState::BudgetLimited,
    ];

    /// States a job may lock its trip from
    pub const LOCKABLE: [CalcState; 2] = [CalcState::Idle, CalcState::Queued];

    /// Every state the transition table allows into `Running`
    pub const RUNNABLE: [CalcState; 5] = [
        CalcState::Idle,
        CalcState::Queued,
        CalcState::Done,
        CalcState::Error,
        CalcState::BudgetLimited,
    ];

    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CalcState::Idle => "idle",
            CalcState::Queued => "queued",
            CalcState::Running => "running",
            CalcState::Done => "done",
            CalcState::Error => "error",
            CalcState::BudgetLimited => "budget_limited",
        }
    }

    /// Treated as idle when deciding whether to enqueue
    #[inline]
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        Self::SCHEDULABLE.contains(self)
    }

    /// A job is pending or in flight
    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CalcState::Queued | CalcState::Running)
    }
}

impl fmt::Display for CalcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-budgeted external provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Route estimation
    Route,
    /// Weather forecast
    Weather,
}

impl Provider {
    /// Both providers
    pub const ALL: [Provider; 2] = [Provider::Route, Provider::Weather];

    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Route => "route",
            Provider::Weather => "weather",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route metrics returned by a route estimator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMetrics {
    /// Route length in meters
    pub distance_m: u64,
    /// Travel time in seconds
    pub duration_s: u64,
    /// Route geometry (GeoJSON LineString)
    pub geometry: serde_json::Value,
    /// Name of the provider that produced the route
    pub provider: String,
}

/// Trip submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrip {
    /// Absolute UTC deadline
    pub deadline_at: DateTime<Utc>,
    /// Ordered waypoints, at least two
    pub waypoints: Vec<Waypoint>,
    /// Policy mode, defaults from configuration
    #[serde(default)]
    pub policy_mode: Option<PolicyMode>,
    /// Per-trip daily route call cap
    #[serde(default)]
    pub route_daily_cap: Option<u32>,
    /// Per-trip daily weather call cap
    #[serde(default)]
    pub weather_daily_cap: Option<u32>,
}

impl NewTrip {
    /// Create new submission with default policy and caps
    #[inline]
    #[must_use]
    pub fn new(deadline_at: DateTime<Utc>, waypoints: Vec<Waypoint>) -> Self {
        Self {
            deadline_at,
            waypoints,
            policy_mode: None,
            route_daily_cap: None,
            weather_daily_cap: None,
        }
    }

    /// With policy mode
    #[inline]
    #[must_use]
    pub fn with_policy(mut self, mode: PolicyMode) -> Self {
        self.policy_mode = Some(mode);
        self
    }

    /// With per-trip daily caps
    #[inline]
    #[must_use]
    pub fn with_caps(mut self, route: u32, weather: u32) -> Self {
        self.route_daily_cap = Some(route);
        self.weather_daily_cap = Some(weather);
        self
    }
}

/// Parse an absolute deadline. Timestamps without an offset are rejected.
pub fn parse_deadline(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| ValidationError::InvalidDeadline(format!("{raw:?}: {e}")))
}

/// Mutable policy fields of a trip
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyPatch {
    /// New policy mode
    pub policy_mode: Option<PolicyMode>,
    /// New per-trip daily route cap
    pub route_daily_cap: Option<u32>,
    /// New per-trip daily weather cap
    pub weather_daily_cap: Option<u32>,
}

impl PolicyPatch {
    /// Nothing to change
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policy_mode.is_none()
            && self.route_daily_cap.is_none()
            && self.weather_daily_cap.is_none()
    }
}

/// A tracked journey
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Immutable after creation
    pub deadline_at: DateTime<Utc>,
    pub waypoints: Vec<Waypoint>,

    pub eta_at: Option<DateTime<Utc>>,
    pub route_distance_m: Option<u64>,
    pub route_duration_s: Option<u64>,
    pub route_geometry: Option<serde_json::Value>,

    /// Signed minutes, deadline minus ETA
    pub buffer_minutes: Option<i64>,
    /// In [0, 100]
    pub delay_risk_pct: Option<u8>,
    pub status: Option<StatusBand>,
    pub suggestion: Option<String>,
    pub recommended_depart_at: Option<DateTime<Utc>>,
    pub why: Option<String>,
    pub customer_message: Option<String>,

    pub policy_mode: PolicyMode,
    pub route_daily_cap: u32,
    pub weather_daily_cap: u32,

    pub next_calc_at: Option<DateTime<Utc>>,
    pub last_calc_at: Option<DateTime<Utc>>,
    pub calc_state: CalcState,
    /// Incremented each time a worker locks the trip
    pub calc_epoch: u64,
    /// When `calc_state` last changed
    pub state_since: DateTime<Utc>,
    /// Failed runs since the last success
    pub consecutive_failures: u32,
}

impl Trip {
    /// Create an idle trip with no computed fields
    #[must_use]
    pub fn new(
        deadline_at: DateTime<Utc>,
        waypoints: Vec<Waypoint>,
        policy_mode: PolicyMode,
        route_daily_cap: u32,
        weather_daily_cap: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TripId::new(),
            created_at: now,
            updated_at: now,
            deadline_at,
            waypoints,
            eta_at: None,
            route_distance_m: None,
            route_duration_s: None,
            route_geometry: None,
            buffer_minutes: None,
            delay_risk_pct: None,
            status: None,
            suggestion: None,
            recommended_depart_at: None,
            why: None,
            customer_message: None,
            policy_mode,
            route_daily_cap,
            weather_daily_cap,
            next_calc_at: None,
            last_calc_at: None,
            calc_state: CalcState::Idle,
            calc_epoch: 0,
            state_since: now,
            consecutive_failures: 0,
        }
    }

    /// Per-trip daily cap for a provider
    #[inline]
    #[must_use]
    pub fn daily_cap(&self, provider: Provider) -> u32 {
        match provider {
            Provider::Route => self.route_daily_cap,
            Provider::Weather => self.weather_daily_cap,
        }
    }

    /// At least one successful computation has been stored
    #[inline]
    #[must_use]
    pub fn has_assessment(&self) -> bool {
        self.delay_risk_pct.is_some() && self.status.is_some()
    }
}

/// Kind tag of an audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Created,
    RecalcQueued,
    RecalcRunning,
    BudgetConsume,
    BudgetDenied,
    RecalcDone,
    RecalcError,
    PolicyUpdated,
    WatchdogTimeout,
}

impl UpdateKind {
    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Created => "created",
            UpdateKind::RecalcQueued => "recalc_queued",
            UpdateKind::RecalcRunning => "recalc_running",
            UpdateKind::BudgetConsume => "budget_consume",
            UpdateKind::BudgetDenied => "budget_denied",
            UpdateKind::RecalcDone => "recalc_done",
            UpdateKind::RecalcError => "recalc_error",
            UpdateKind::PolicyUpdated => "policy_updated",
            UpdateKind::WatchdogTimeout => "watchdog_timeout",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripUpdate {
    /// Monotonic sequence, unique per store
    pub id: u64,
    pub trip_id: TripId,
    pub at: DateTime<Utc>,
    pub kind: UpdateKind,
    pub payload: serde_json::Value,
}

/// Audit entry not yet assigned a sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDraft {
    pub kind: UpdateKind,
    pub payload: serde_json::Value,
}

impl UpdateDraft {
    /// Create new draft
    #[inline]
    #[must_use]
    pub fn new(kind: UpdateKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }
}

/// Owner of a usage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UsageScope {
    /// Shared by every trip
    Global,
    /// A single trip
    Trip(TripId),
}

/// Time window of a usage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Bucket {
    /// UTC calendar day
    Day(NaiveDate),
    /// Minutes since the Unix epoch
    Minute(i64),
}

impl Bucket {
    /// Day bucket containing `now`
    #[inline]
    #[must_use]
    pub fn day(now: DateTime<Utc>) -> Self {
        Bucket::Day(now.date_naive())
    }

    /// Minute bucket containing `now`
    #[inline]
    #[must_use]
    pub fn minute(now: DateTime<Utc>) -> Self {
        Bucket::Minute(now.timestamp().div_euclid(60))
    }
}

/// Key of a usage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    pub scope: UsageScope,
    pub provider: Provider,
    pub bucket: Bucket,
}

impl UsageKey {
    /// Create new key
    #[inline]
    #[must_use]
    pub const fn new(scope: UsageScope, provider: Provider, bucket: Bucket) -> Self {
        Self {
            scope,
            provider,
            bucket,
        }
    }
}

/// Today's calls against one provider for a trip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub provider: Provider,
    pub calls: u64,
    pub cap: u32,
}

/// Trip snapshot with recent audit entries and today's usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripHistory {
    pub trip: Trip,
    /// Newest first
    pub updates: Vec<TripUpdate>,
    pub usage_today: Vec<ProviderUsage>,
}
