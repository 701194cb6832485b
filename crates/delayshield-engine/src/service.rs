//! Transport-agnostic trip surface
//!
//! Every call returns without waiting for a recalculation; results are
//! observed by polling `get`, `list` or `history`. Only validation errors
//! are reported synchronously.

use crate::budget::BudgetLedger;
use crate::error::{EngineError, ProviderError};
use crate::providers::RouteEstimator;
use crate::scheduler::{RecalcScheduler, Trigger};
use crate::store::TripStore;
use delayshield_core::{
    clip_waypoints, validate_waypoints, Clock, NewTrip, PolicyPatch, Provider, ProviderUsage,
    RouteMetrics, Trip, TripDefaults, TripHistory, TripId, UpdateDraft, UpdateKind,
    ValidationError, Waypoint,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Front door of the engine
#[derive(Debug)]
pub struct TripService {
    store: Arc<dyn TripStore>,
    ledger: Arc<BudgetLedger>,
    scheduler: Arc<RecalcScheduler>,
    route: Arc<dyn RouteEstimator>,
    clock: Arc<dyn Clock>,
    defaults: TripDefaults,
    max_route_waypoints: usize,
    provider_timeout: Duration,
}

impl TripService {
    /// Create service
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<dyn TripStore>,
        ledger: Arc<BudgetLedger>,
        scheduler: Arc<RecalcScheduler>,
        route: Arc<dyn RouteEstimator>,
        clock: Arc<dyn Clock>,
        defaults: TripDefaults,
        max_route_waypoints: usize,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            scheduler,
            route,
            clock,
            defaults,
            max_route_waypoints,
            provider_timeout,
        }
    }

    /// Create a trip and schedule its first run.
    ///
    /// # Errors
    /// - `EngineError::Validation` for fewer than two valid waypoints or a
    ///   zero cap; nothing is stored and no job is queued
    pub fn create(&self, new: NewTrip) -> Result<Trip, EngineError> {
        validate_waypoints(&new.waypoints)?;
        let route_cap = new.route_daily_cap.unwrap_or(self.defaults.route_daily_cap);
        let weather_cap = new
            .weather_daily_cap
            .unwrap_or(self.defaults.weather_daily_cap);
        check_cap(Provider::Route, route_cap)?;
        check_cap(Provider::Weather, weather_cap)?;

        let now = self.clock.now();
        let mode = new.policy_mode.unwrap_or(self.defaults.policy_mode);
        let mut trip = Trip::new(new.deadline_at, new.waypoints, mode, route_cap, weather_cap, now);
        trip.next_calc_at = Some(now);

        let audit = UpdateDraft::new(
            UpdateKind::Created,
            json!({
                "deadline_at": trip.deadline_at,
                "waypoints_n": trip.waypoints.len(),
                "policy_mode": mode,
            }),
        );
        let trip = self.store.insert(trip, audit)?;
        tracing::info!(trip_id = %trip.id, deadline_at = %trip.deadline_at, policy_mode = %mode, "trip created");

        match self.scheduler.request(trip.id, Trigger::Create) {
            Ok(trip) => Ok(trip),
            // Still due now, the next scan picks it up
            Err(EngineError::QueueClosed) => {
                tracing::warn!(trip_id = %trip.id, "job queue closed, first run deferred");
                Ok(self.store.get(trip.id)?)
            }
            Err(e) => Err(e),
        }
    }

    /// Current snapshot
    pub fn get(&self, id: TripId) -> Result<Trip, EngineError> {
        Ok(self.store.get(id)?)
    }

    /// All trips, newest first
    #[must_use]
    pub fn list(&self) -> Vec<Trip> {
        self.store.list()
    }

    /// Enqueue a run unless one is queued or running; either way return
    /// the current snapshot
    pub fn recalc(&self, id: TripId) -> Result<Trip, EngineError> {
        self.scheduler.request(id, Trigger::User)
    }

    /// Route metrics for ad-hoc waypoints. No trip is created; one call is
    /// charged to the global route budget.
    pub async fn preview(&self, waypoints: &[Waypoint]) -> Result<RouteMetrics, EngineError> {
        validate_waypoints(waypoints)?;
        self.ledger
            .authorize(Provider::Route, None, self.clock.now())?;

        let clipped = clip_waypoints(waypoints, self.max_route_waypoints);
        match tokio::time::timeout(self.provider_timeout, self.route.estimate(&clipped)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProviderError::Timeout {
                after_ms: u64::try_from(self.provider_timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into()),
        }
    }

    /// Change policy mode or caps; applies from the next run.
    /// Deadline and waypoints cannot change.
    pub fn update_policy(&self, id: TripId, patch: PolicyPatch) -> Result<Trip, EngineError> {
        if let Some(cap) = patch.route_daily_cap {
            check_cap(Provider::Route, cap)?;
        }
        if let Some(cap) = patch.weather_daily_cap {
            check_cap(Provider::Weather, cap)?;
        }
        if patch.is_empty() {
            return self.get(id);
        }

        let mut changes = Map::new();
        if let Some(mode) = patch.policy_mode {
            changes.insert("policy_mode".into(), json!(mode));
        }
        if let Some(cap) = patch.route_daily_cap {
            changes.insert("route_daily_cap".into(), json!(cap));
        }
        if let Some(cap) = patch.weather_daily_cap {
            changes.insert("weather_daily_cap".into(), json!(cap));
        }

        let audit = UpdateDraft::new(UpdateKind::PolicyUpdated, Value::Object(changes));
        let trip = self
            .store
            .update_policy(id, &patch, self.clock.now(), audit)?;
        tracing::info!(trip_id = %id, policy_mode = %trip.policy_mode, "policy updated");
        Ok(trip)
    }

    /// Snapshot with the latest `limit` audit entries and today's usage
    pub fn history(&self, id: TripId, limit: usize) -> Result<TripHistory, EngineError> {
        let trip = self.store.get(id)?;
        let updates = self.store.updates(id, limit)?;
        let now = self.clock.now();
        let usage_today = Provider::ALL
            .into_iter()
            .map(|provider| ProviderUsage {
                provider,
                calls: self.ledger.trip_used_today(id, provider, now),
                cap: trip.daily_cap(provider),
            })
            .collect();
        Ok(TripHistory {
            trip,
            updates,
            usage_today,
        })
    }

    /// Remove a trip, its audit log and its usage counters.
    /// A job still running for it ends as `NotFound` at commit.
    pub fn delete(&self, id: TripId) -> Result<Trip, EngineError> {
        let trip = self.store.delete(id)?;
        self.ledger.remove_trip(id);
        tracing::info!(trip_id = %id, "trip deleted");
        Ok(trip)
    }
}

fn check_cap(provider: Provider, cap: u32) -> Result<(), ValidationError> {
    if cap == 0 {
        Err(ValidationError::InvalidCap { provider })
    } else {
        Ok(())
    }
}
