//! Error types for DelayShield Core
//!
//! Covers failures that can be decided without touching storage or providers:
//! - Trip submission validation
//! - Illegal calc-state transitions
//! - Configuration loading

use crate::types::{CalcState, Provider};

/// Synchronous rejection of a trip submission or policy change
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Fewer than two usable waypoints
    #[error("need at least 2 valid waypoints, got {valid}")]
    TooFewWaypoints { valid: usize },

    /// Waypoint outside coordinate ranges or not finite
    #[error("invalid waypoint #{index}: ({lat}, {lon})")]
    InvalidWaypoint { index: usize, lat: f64, lon: f64 },

    /// Waypoint text not in `lat,lon` form
    #[error("unparsable waypoint: {0:?}")]
    UnparsableWaypoint(String),

    /// Deadline missing or not an absolute timestamp
    #[error("invalid deadline: {0}")]
    InvalidDeadline(String),

    /// Policy mode outside the known set
    #[error("policy_mode must be conservative|balanced|aggressive, got {0:?}")]
    UnknownPolicyMode(String),

    /// Per-trip cap of zero
    #[error("per-trip {provider} cap must be positive")]
    InvalidCap { provider: Provider },
}

/// Calc-state machine violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the allowed table
    #[error("illegal calc-state transition {from} -> {to}")]
    IllegalTransition { from: CalcState, to: CalcState },
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for the schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override not parseable
    #[error("invalid environment override {key}={value:?}")]
    Env { key: String, value: String },

    /// Values are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
