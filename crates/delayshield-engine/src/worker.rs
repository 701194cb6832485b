//! Recalculation worker
//!
//! Per job:
//! 1. Lock the trip (`idle|queued -> running` at the job's epoch); losing
//!    the race ends the job silently
//! 2. Take one route grant from the ledger, covering every retry
//! 3. Call the route estimator with bounded retries and backoff
//! 4. Best effort weather (own grant, failures ignored)
//! 5. Score and commit in one write, epoch-guarded
//!
//! The whole job runs under `job_timeout`; hitting it commits `error`.

use crate::budget::BudgetLedger;
use crate::error::{ProviderError, StoreError};
use crate::providers::{RouteEstimator, TimeWindow, WeatherReport, WeatherRiskAdjuster};
use crate::scheduler::{JobReceiver, RecalcJob, RecalcScheduler};
use crate::store::{Completion, ComputedFields, TransitionOutcome, TripStore};
use delayshield_core::{
    clock, clip_waypoints, customer_message, Clock, Provider, RiskInputs, RiskScorer,
    RouteMetrics, StatusBand, Trip, UpdateDraft, UpdateKind, Waypoint, WorkerConfig,
};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

/// How a job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// New assessment stored
    Done(StatusBand),
    /// Route budget denied
    BudgetLimited,
    /// Route provider failed or the job timed out
    Failed,
    /// Another job held the trip
    LockLost,
    /// The watchdog took the trip away before commit
    Superseded,
    /// Trip was deleted
    NotFound,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Done(status) => write!(f, "done ({status})"),
            JobOutcome::BudgetLimited => f.write_str("budget_limited"),
            JobOutcome::Failed => f.write_str("error"),
            JobOutcome::LockLost => f.write_str("lock_lost"),
            JobOutcome::Superseded => f.write_str("superseded"),
            JobOutcome::NotFound => f.write_str("not_found"),
        }
    }
}

/// Result of the provider phase of a job
enum RunResult {
    Computed {
        fields: ComputedFields,
        audit: UpdateDraft,
    },
    BudgetDenied,
    RouteFailed {
        stage: &'static str,
        error: ProviderError,
        attempts: u32,
    },
}

/// Runs recalculation jobs
#[derive(Debug)]
pub struct RecalcWorker {
    store: Arc<dyn TripStore>,
    ledger: Arc<BudgetLedger>,
    route: Arc<dyn RouteEstimator>,
    weather: Option<Arc<dyn WeatherRiskAdjuster>>,
    scorer: RiskScorer,
    scheduler: Arc<RecalcScheduler>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    max_route_waypoints: usize,
}

impl RecalcWorker {
    /// Create worker
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<dyn TripStore>,
        ledger: Arc<BudgetLedger>,
        route: Arc<dyn RouteEstimator>,
        weather: Option<Arc<dyn WeatherRiskAdjuster>>,
        scorer: RiskScorer,
        scheduler: Arc<RecalcScheduler>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
        max_route_waypoints: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            route,
            weather,
            scorer,
            scheduler,
            clock,
            config,
            max_route_waypoints,
        }
    }

    /// Process one job to completion
    pub async fn process(&self, job: RecalcJob) -> JobOutcome {
        let span = tracing::info_span!("recalc", trip_id = %job.trip_id, trigger = %job.trigger);
        async move {
            let outcome = self.process_inner(job).await;
            tracing::debug!(%outcome, "job finished");
            outcome
        }
        .instrument(span)
        .await
    }

    /// Pull jobs from `jobs` until the queue closes or `shutdown` fires
    pub async fn run(self: Arc<Self>, jobs: JobReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.process(job).await;
        }
        tracing::debug!("worker stopped");
    }

    async fn process_inner(&self, job: RecalcJob) -> JobOutcome {
        let id = job.trip_id;
        let now = self.clock.now();
        let audit = UpdateDraft::new(
            UpdateKind::RecalcRunning,
            json!({ "trigger": job.trigger.as_str() }),
        );

        let trip = match self
            .store
            .lock(id, job.epoch, now, Some(audit))
        {
            Ok(TransitionOutcome::Applied(trip)) => trip,
            Ok(TransitionOutcome::Rejected(trip)) => {
                tracing::debug!(
                    state = %trip.calc_state,
                    epoch = trip.calc_epoch,
                    job_epoch = job.epoch,
                    "trip locked by another job"
                );
                return JobOutcome::LockLost;
            }
            Err(StoreError::NotFound(_)) => return JobOutcome::NotFound,
            Err(e) => {
                tracing::error!(error = %e, "failed to lock trip");
                return JobOutcome::Failed;
            }
        };

        let result = match tokio::time::timeout(self.config.job_timeout(), self.compute(&trip)).await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(timeout_s = self.config.job_timeout_secs, "job timed out");
                RunResult::RouteFailed {
                    stage: "timeout",
                    error: ProviderError::Timeout {
                        after_ms: self.config.job_timeout_secs.saturating_mul(1000),
                    },
                    attempts: 0,
                }
            }
        };

        self.finish(&trip, result)
    }

    async fn compute(&self, trip: &Trip) -> RunResult {
        let now = self.clock.now();
        if let Err(denial) = self.ledger.authorize(
            Provider::Route,
            Some((trip.id, trip.route_daily_cap)),
            now,
        ) {
            tracing::info!(%denial, "route budget denied");
            self.audit(trip, UpdateKind::BudgetDenied, json!({
                "provider": Provider::Route.as_str(),
                "reason": denial.to_string(),
            }));
            return RunResult::BudgetDenied;
        }
        self.audit(trip, UpdateKind::BudgetConsume, json!({ "provider": Provider::Route.as_str() }));

        let waypoints = clip_waypoints(&trip.waypoints, self.max_route_waypoints);
        let route = match self.route_with_retries(&waypoints).await {
            Ok(route) => route,
            Err((error, attempts)) => {
                return RunResult::RouteFailed {
                    stage: "route",
                    error,
                    attempts,
                }
            }
        };

        let started = self.clock.now();
        let travel = clock::seconds(route.duration_s);
        let window = TimeWindow {
            start: started,
            end: started + travel,
        };
        let weather = self.weather(trip, &waypoints, window).await;

        let assessment = self.scorer.score(&RiskInputs {
            route_duration_s: route.duration_s,
            route_distance_m: route.distance_m,
            deadline_at: trip.deadline_at,
            now: started,
            weather: weather.as_ref().map(|w| w.modifier),
            policy_mode: trip.policy_mode,
        });
        let message = customer_message(&assessment, trip.deadline_at);

        let audit = UpdateDraft::new(
            UpdateKind::RecalcDone,
            json!({
                "route": {
                    "distance_m": route.distance_m,
                    "duration_s": route.duration_s,
                    "provider": route.provider,
                },
                "weather": weather.as_ref().map(|w| w.details.clone()),
                "buffer_minutes": assessment.buffer_minutes,
                "delay_risk_pct": assessment.delay_risk_pct,
                "status": assessment.status,
                "computed_at": started,
                "why": assessment.why,
            }),
        );

        RunResult::Computed {
            fields: ComputedFields {
                eta_at: assessment.eta_at,
                route_distance_m: route.distance_m,
                route_duration_s: route.duration_s,
                route_geometry: route.geometry,
                buffer_minutes: assessment.buffer_minutes,
                delay_risk_pct: assessment.delay_risk_pct,
                status: assessment.status,
                suggestion: assessment.suggestion,
                recommended_depart_at: assessment.recommended_depart_at,
                why: assessment.why,
                customer_message: message,
            },
            audit,
        }
    }

    async fn route_with_retries(
        &self,
        waypoints: &[Waypoint],
    ) -> Result<RouteMetrics, (ProviderError, u32)> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match tokio::time::timeout(
                self.config.provider_timeout(),
                self.route.estimate(waypoints),
            )
            .await
            {
                Ok(Ok(route)) => return Ok(route),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout {
                    after_ms: self.config.provider_timeout_secs.saturating_mul(1000),
                },
            };

            if !error.is_retryable() || attempt >= max_attempts {
                tracing::error!(attempt, error = %error, "route provider failed");
                return Err((error, attempt));
            }
            let backoff = self.config.backoff(attempt);
            tracing::warn!(
                attempt,
                error = %error,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "route provider failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Weather never fails the job; any problem means no modifier
    async fn weather(
        &self,
        trip: &Trip,
        waypoints: &[Waypoint],
        window: TimeWindow,
    ) -> Option<WeatherReport> {
        let adjuster = self.weather.as_ref()?;
        let now = self.clock.now();

        if let Err(denial) = self.ledger.authorize(
            Provider::Weather,
            Some((trip.id, trip.weather_daily_cap)),
            now,
        ) {
            tracing::info!(%denial, "weather budget denied");
            self.audit(trip, UpdateKind::BudgetDenied, json!({
                "provider": Provider::Weather.as_str(),
                "reason": denial.to_string(),
            }));
            return None;
        }
        self.audit(trip, UpdateKind::BudgetConsume, json!({ "provider": Provider::Weather.as_str() }));

        match tokio::time::timeout(self.config.provider_timeout(), adjuster.adjust(waypoints, window))
            .await
        {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "weather skipped");
                None
            }
            Err(_) => {
                tracing::warn!("weather timed out, skipped");
                None
            }
        }
    }

    fn finish(&self, trip: &Trip, result: RunResult) -> JobOutcome {
        let now = self.clock.now();
        let (completion, audit, status, failures, outcome) = match result {
            RunResult::Computed { fields, audit } => {
                let status = fields.status;
                (
                    Completion::Done(fields),
                    Some(audit),
                    Some(status),
                    0,
                    JobOutcome::Done(status),
                )
            }
            // budget_denied is already in the log
            RunResult::BudgetDenied => (
                Completion::BudgetLimited,
                None,
                trip.status,
                trip.consecutive_failures,
                JobOutcome::BudgetLimited,
            ),
            RunResult::RouteFailed {
                stage,
                error,
                attempts,
            } => (
                Completion::Error,
                Some(UpdateDraft::new(
                    UpdateKind::RecalcError,
                    json!({
                        "stage": stage,
                        "error": error.to_string(),
                        "attempts": attempts,
                    }),
                )),
                trip.status,
                trip.consecutive_failures.saturating_add(1),
                JobOutcome::Failed,
            ),
        };

        let next = self.scheduler.next_due(
            trip.policy_mode,
            status,
            completion.state(),
            failures,
            now,
        );

        match self
            .store
            .commit(trip.id, trip.calc_epoch, completion, now, next, audit)
        {
            Ok(true) => {
                tracing::info!(%outcome, next_calc_at = %next, "recalc committed");
                outcome
            }
            Ok(false) => {
                tracing::warn!("trip no longer held by this job, result dropped");
                JobOutcome::Superseded
            }
            Err(StoreError::NotFound(_)) => JobOutcome::NotFound,
            Err(e) => {
                tracing::error!(error = %e, "commit failed");
                JobOutcome::Failed
            }
        }
    }

    fn audit(&self, trip: &Trip, kind: UpdateKind, payload: serde_json::Value) {
        if let Err(e) = self
            .store
            .append_update(trip.id, self.clock.now(), UpdateDraft::new(kind, payload))
        {
            tracing::debug!(error = %e, %kind, "audit entry dropped");
        }
    }
}
