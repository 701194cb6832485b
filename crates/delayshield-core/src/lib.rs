//! DelayShield Core - domain model of the trip recalculation engine
//!
//! Everything here is pure or storage-free:
//! - Trip records, audit entries and usage counter keys
//! - The risk scorer and its policy table
//! - The calc-state transition table
//! - Waypoint validation and clipping
//! - Engine configuration
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use delayshield_core::{PolicyMode, RiskInputs, RiskScorer, StatusBand};
//!
//! let now = Utc::now();
//! let scorer = RiskScorer::default();
//! let assessment = scorer.score(&RiskInputs {
//!     route_duration_s: 26_700,
//!     route_distance_m: 586_000,
//!     deadline_at: now + Duration::hours(12),
//!     now,
//!     weather: None,
//!     policy_mode: PolicyMode::Balanced,
//! });
//! assert_eq!(assessment.status, StatusBand::Green);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod risk;
pub mod state_machine;
pub mod types;
pub mod waypoints;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BandIntervals, BudgetConfig, EngineConfig, PolicyParams, ProviderConfig, ProviderLimits,
    RiskConfig, ScheduleConfig, TripDefaults, WorkerConfig,
};
pub use error::{ConfigError, StateMachineError, ValidationError};
pub use risk::{customer_message, RiskAssessment, RiskInputs, RiskScorer, WeatherModifier};
pub use types::{
    parse_deadline, Bucket, CalcState, NewTrip, PolicyMode, PolicyPatch, Provider, ProviderUsage,
    RouteMetrics, StatusBand, Trip, TripHistory, TripId, TripUpdate, UpdateDraft, UpdateKind,
    UsageKey, UsageScope, Waypoint,
};
pub use waypoints::{clip_waypoints, validate_waypoints};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
