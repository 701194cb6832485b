//! Recalculation scheduling
//!
//! Jobs are enqueued on trip creation, on demand, or when a trip's next-due
//! time passes. Enqueueing is a conditional `schedulable -> queued` change,
//! so a trip already queued or running never gets a second job; the caller
//! just gets the current snapshot back.

use crate::error::EngineError;
use crate::store::{TransitionOutcome, TripStore};
use chrono::{DateTime, Utc};
use delayshield_core::{
    CalcState, Clock, PolicyMode, ScheduleConfig, StatusBand, Trip, TripId, UpdateDraft,
    UpdateKind,
};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;

/// What caused a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Trip submission
    Create,
    /// On-demand request
    User,
    /// Next-due time passed
    Scheduler,
}

impl Trigger {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Create => "create",
            Trigger::User => "user",
            Trigger::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work for the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecalcJob {
    pub trip_id: TripId,
    pub trigger: Trigger,
    /// Trip `calc_epoch` when the job was queued
    pub epoch: u64,
}

/// Receiving end of the job queue, shared by every worker
#[derive(Debug, Clone)]
pub struct JobReceiver {
    inner: Arc<Mutex<mpsc::UnboundedReceiver<RecalcJob>>>,
}

impl JobReceiver {
    /// Next job; `None` once every sender is gone and the queue is empty
    pub async fn recv(&self) -> Option<RecalcJob> {
        self.inner.lock().await.recv().await
    }

    /// Next job if one is ready now
    pub async fn try_recv(&self) -> Option<RecalcJob> {
        self.inner.lock().await.try_recv().ok()
    }
}

/// Decides when trips run and feeds the job queue
#[derive(Debug)]
pub struct RecalcScheduler {
    store: Arc<dyn TripStore>,
    clock: Arc<dyn Clock>,
    config: ScheduleConfig,
    jobs: mpsc::UnboundedSender<RecalcJob>,
}

impl RecalcScheduler {
    /// Create scheduler and the queue its jobs go to
    #[must_use]
    pub fn new(
        store: Arc<dyn TripStore>,
        clock: Arc<dyn Clock>,
        config: ScheduleConfig,
    ) -> (Self, JobReceiver) {
        let (jobs, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            store,
            clock,
            config,
            jobs,
        };
        let receiver = JobReceiver {
            inner: Arc::new(Mutex::new(rx)),
        };
        (scheduler, receiver)
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Enqueue a job for `id` unless one is already queued or running.
    ///
    /// Never waits for the job. Returns the trip as observable right after
    /// the request.
    ///
    /// # Errors
    /// - `EngineError::NotFound` for an unknown trip
    /// - `EngineError::QueueClosed` if the worker pool is gone
    pub fn request(&self, id: TripId, trigger: Trigger) -> Result<Trip, EngineError> {
        self.enqueue(id, trigger).map(|(trip, _)| trip)
    }

    /// Enqueue due trips, earliest first, at most `scan_batch` per call.
    /// Returns how many jobs were enqueued.
    pub fn scan_due(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let mut enqueued = 0;
        for trip in self.store.due(now, self.config.scan_batch) {
            match self.enqueue(trip.id, Trigger::Scheduler) {
                Ok((_, true)) => enqueued += 1,
                Ok((_, false)) | Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(enqueued)
    }

    /// When a trip should run next after a job ended in `outcome`.
    ///
    /// `status` is the band after the job (the previous band if the job
    /// did not compute one). Trips without any band use the yellow interval.
    #[must_use]
    pub fn next_due(
        &self,
        mode: PolicyMode,
        status: Option<StatusBand>,
        outcome: CalcState,
        consecutive_failures: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let band_interval = self
            .config
            .intervals(mode)
            .for_band(status.unwrap_or(StatusBand::Yellow));
        let delay = match outcome {
            CalcState::BudgetLimited => self.config.budget_retry().min(band_interval),
            CalcState::Error => self.config.error_backoff(consecutive_failures),
            _ => band_interval,
        };
        now + delay
    }

    /// Periodic due scan until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.scan_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => match self.scan_due() {
                    Ok(0) => {}
                    Ok(enqueued) => tracing::info!(enqueued, "due trips enqueued"),
                    Err(EngineError::QueueClosed) => {
                        tracing::warn!("job queue closed, stopping due scan");
                        break;
                    }
                    Err(e) => tracing::error!(error = %e, "due scan failed"),
                },
            }
        }
        tracing::debug!("due scan stopped");
    }

    fn enqueue(&self, id: TripId, trigger: Trigger) -> Result<(Trip, bool), EngineError> {
        let now = self.clock.now();
        let audit = UpdateDraft::new(UpdateKind::RecalcQueued, json!({ "by": trigger.as_str() }));

        match self
            .store
            .transition(id, &CalcState::SCHEDULABLE, CalcState::Queued, now, Some(audit))?
        {
            TransitionOutcome::Rejected(trip) => {
                tracing::debug!(trip_id = %id, state = %trip.calc_state, %trigger, "recalc already in flight");
                Ok((trip, false))
            }
            TransitionOutcome::Applied(trip) => {
                let job = RecalcJob {
                    trip_id: id,
                    trigger,
                    epoch: trip.calc_epoch,
                };
                if self.jobs.send(job).is_err() {
                    let audit = UpdateDraft::new(
                        UpdateKind::RecalcError,
                        json!({ "stage": "enqueue", "error": "job queue closed" }),
                    );
                    if let Err(e) = self.store.release(id, trip.state_since, now, audit) {
                        tracing::warn!(trip_id = %id, error = %e, "failed to release queued trip");
                    }
                    return Err(EngineError::QueueClosed);
                }
                tracing::debug!(trip_id = %id, %trigger, "recalc queued");
                Ok((trip, true))
            }
        }
    }
}
