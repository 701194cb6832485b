//! Watchdog for wedged jobs
//!
//! A worker bounds its own job with `job_timeout`, but a panicked or
//! cancelled task never commits. Each tick:
//! - running longer than `stuck_after` is forced to `error`
//! - queued longer than `stuck_after` (job lost) goes back to `idle`, due now
//!
//! Both are guarded so a job that finishes in the meantime wins. A released
//! trip's job may only be stuck behind a backlog; it carries the trip's
//! epoch, so it and any rescheduled job share one lock and one run.

use crate::scheduler::RecalcScheduler;
use crate::store::TripStore;
use chrono::{DateTime, Duration, Utc};
use delayshield_core::{CalcState, Clock, Trip, UpdateDraft, UpdateKind};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Running trips forced to error
    pub forced: usize,
    /// Queued trips returned to idle
    pub released: usize,
}

/// Periodic sweeper of stuck trips
#[derive(Debug)]
pub struct Watchdog {
    store: Arc<dyn TripStore>,
    scheduler: Arc<RecalcScheduler>,
    clock: Arc<dyn Clock>,
    stuck_after: Duration,
    interval: std::time::Duration,
}

impl Watchdog {
    #[must_use]
    pub fn new(
        store: Arc<dyn TripStore>,
        scheduler: Arc<RecalcScheduler>,
        clock: Arc<dyn Clock>,
        stuck_after: Duration,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            clock,
            stuck_after,
            interval,
        }
    }

    /// One pass over stale trips
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let cutoff = now - self.stuck_after;
        let mut report = SweepReport::default();

        for trip in self.store.stale(cutoff) {
            let age_s = (now - trip.state_since).num_seconds();
            let audit = UpdateDraft::new(
                UpdateKind::WatchdogTimeout,
                json!({ "state": trip.calc_state, "age_s": age_s, "epoch": trip.calc_epoch }),
            );

            let applied = match trip.calc_state {
                CalcState::Running => {
                    let failures = trip.consecutive_failures.saturating_add(1);
                    let next = self.next_after_error(&trip, failures, now);
                    self.store
                        .force_error(trip.id, trip.calc_epoch, now, next, audit)
                }
                CalcState::Queued => self.store.release(trip.id, trip.state_since, now, audit),
                _ => Ok(false),
            };

            match (applied, trip.calc_state) {
                (Ok(true), CalcState::Running) => {
                    report.forced += 1;
                    tracing::error!(trip_id = %trip.id, age_s, "stuck job forced to error");
                }
                (Ok(true), _) => {
                    report.released += 1;
                    tracing::warn!(trip_id = %trip.id, age_s, "lost job, trip released");
                }
                // finished or deleted in the meantime
                (Ok(false), _) => {}
                (Err(e), _) => {
                    tracing::debug!(trip_id = %trip.id, error = %e, "watchdog skipped trip");
                }
            }
        }
        report
    }

    /// Sweep every `interval` until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(std::time::Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report != SweepReport::default() {
                        tracing::info!(forced = report.forced, released = report.released, "watchdog sweep");
                    }
                }
            }
        }
        tracing::debug!("watchdog stopped");
    }

    fn next_after_error(&self, trip: &Trip, failures: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        self.scheduler
            .next_due(trip.policy_mode, trip.status, CalcState::Error, failures, now)
    }
}
