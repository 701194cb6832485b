//! Error types for the DelayShield engine
//!
//! Only validation failures surface synchronously to trip submitters;
//! everything else is recorded on the trip and observed by polling:
//! - Budget denials become `budget_limited`
//! - Exhausted provider retries become `error`
//! - Lost lock races are not errors at all (see `JobOutcome::LockLost`)

use delayshield_core::{ConfigError, Provider, StateMachineError, TripId, ValidationError};
use std::fmt;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Submission rejected
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Provider budget exhausted
    #[error("budget exceeded: {0}")]
    BudgetExceeded(#[from] BudgetDenial),

    /// Provider call failed
    #[error("provider failed: {0}")]
    Provider(#[from] ProviderError),

    /// Storage failure
    #[error("store error: {0}")]
    Store(StoreError),

    /// Unknown trip
    #[error("trip not found: {0}")]
    NotFound(TripId),

    /// Bad configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Workers have shut down
    #[error("job queue closed")]
    QueueClosed,
}

impl EngineError {
    /// Check if retrying later can succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BudgetExceeded(_) => true,
            Self::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Store(other),
        }
    }
}

/// Failures of a route or weather provider call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// No response within the call timeout
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Provider refused the waypoints
    #[error("invalid waypoints: {0}")]
    InvalidWaypoints(String),

    /// Upstream rate limit hit
    #[error("upstream rate limit")]
    RateLimited,

    /// Transport or server failure
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Response did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Provider cannot run (missing key, disabled)
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Check if the same request may succeed on retry
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RateLimited | Self::Upstream(_) | Self::Decode(_)
        )
    }
}

/// Trip store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Unknown trip
    #[error("trip not found: {0}")]
    NotFound(TripId),

    /// Duplicate insert
    #[error("trip already exists: {0}")]
    AlreadyExists(TripId),

    /// Calc-state table violated
    #[error(transparent)]
    Transition(#[from] StateMachineError),
}

/// Which cap denied a budget request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// Per-trip daily cap
    TripDaily,
    /// Global daily cap
    GlobalDaily,
    /// Global per-minute cap
    GlobalMinute,
    /// Per-trip per-minute cap
    TripMinute,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitKind::TripDaily => "trip_daily_cap",
            LimitKind::GlobalDaily => "global_daily_limit",
            LimitKind::GlobalMinute => "per_min_limit",
            LimitKind::TripMinute => "trip_per_min_limit",
        })
    }
}

/// Budget request denied; no counter was incremented
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{limit} {provider} {used}/{cap}")]
pub struct BudgetDenial {
    pub provider: Provider,
    pub limit: LimitKind,
    pub used: u64,
    pub cap: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_display_names_cap() {
        let denial = BudgetDenial {
            provider: Provider::Route,
            limit: LimitKind::GlobalDaily,
            used: 400,
            cap: 400,
        };
        assert_eq!(denial.to_string(), "global_daily_limit route 400/400");
    }

    #[test]
    fn provider_error_is_retryable() {
        assert!(ProviderError::Timeout { after_ms: 10 }.is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(!ProviderError::InvalidWaypoints("x".into()).is_retryable());
        assert!(!ProviderError::NotConfigured("key".into()).is_retryable());
    }

    #[test]
    fn store_not_found_maps_to_engine_not_found() {
        let id = TripId::new();
        let err: EngineError = StoreError::NotFound(id).into();
        assert!(matches!(err, EngineError::NotFound(got) if got == id));
        assert!(!err.is_retryable());
    }
}
