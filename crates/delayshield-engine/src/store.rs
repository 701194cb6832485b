//! Trip persistence
//!
//! The store is the only place calc state changes. Every mutation is a
//! single write under one lock, so readers never observe a half-applied job:
//! - `transition` is the conditional state change behind enqueueing
//! - `lock` is the per-trip advisory lock, tied to one queue entry by epoch
//! - `commit` ends a job, accepted only while the job still owns the trip
//! - `force_error` / `release` are the watchdog's epoch- or time-guarded escapes
//!
//! Audit entries are append-only and get a store-wide monotonic id.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use delayshield_core::state_machine::validate_transition;
use delayshield_core::{
    CalcState, PolicyPatch, StatusBand, Trip, TripId, TripUpdate, UpdateDraft,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;

/// Result of a conditional calc-state change
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// State changed; snapshot after the change
    Applied(Trip),
    /// Current state not in the expected set; snapshot unchanged
    Rejected(Trip),
}

impl TransitionOutcome {
    /// Snapshot either way
    #[inline]
    #[must_use]
    pub fn into_trip(self) -> Trip {
        match self {
            Self::Applied(trip) | Self::Rejected(trip) => trip,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Fields written by a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedFields {
    pub eta_at: DateTime<Utc>,
    pub route_distance_m: u64,
    pub route_duration_s: u64,
    pub route_geometry: serde_json::Value,
    pub buffer_minutes: i64,
    pub delay_risk_pct: u8,
    pub status: StatusBand,
    pub suggestion: String,
    pub recommended_depart_at: Option<DateTime<Utc>>,
    pub why: String,
    pub customer_message: String,
}

impl ComputedFields {
    fn apply_to(self, trip: &mut Trip) {
        trip.eta_at = Some(self.eta_at);
        trip.route_distance_m = Some(self.route_distance_m);
        trip.route_duration_s = Some(self.route_duration_s);
        trip.route_geometry = Some(self.route_geometry);
        trip.buffer_minutes = Some(self.buffer_minutes);
        trip.delay_risk_pct = Some(self.delay_risk_pct);
        trip.status = Some(self.status);
        trip.suggestion = Some(self.suggestion);
        trip.recommended_depart_at = self.recommended_depart_at;
        trip.why = Some(self.why);
        trip.customer_message = Some(self.customer_message);
    }
}

/// End of one job
///
/// Only `Done` carries computed fields, so a failed or budget-limited run
/// has no way to touch the last known good assessment.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Done(ComputedFields),
    Error,
    BudgetLimited,
}

impl Completion {
    /// Calc state this completion moves the trip to
    #[inline]
    #[must_use]
    pub fn state(&self) -> CalcState {
        match self {
            Self::Done(_) => CalcState::Done,
            Self::Error => CalcState::Error,
            Self::BudgetLimited => CalcState::BudgetLimited,
        }
    }
}

/// Trip and audit log storage
pub trait TripStore: Send + Sync + Debug {
    /// Insert a new trip together with its first audit entry
    ///
    /// # Errors
    /// - `StoreError::AlreadyExists` if the id is taken
    fn insert(&self, trip: Trip, audit: UpdateDraft) -> Result<Trip, StoreError>;

    /// Current snapshot
    fn get(&self, id: TripId) -> Result<Trip, StoreError>;

    /// All trips, newest first
    fn list(&self) -> Vec<Trip>;

    /// Remove a trip and its audit log
    fn delete(&self, id: TripId) -> Result<Trip, StoreError>;

    /// Move to `to` only if the current state is one of `from`.
    ///
    /// Entering `Running` increments `calc_epoch`. `audit` is appended only
    /// when the change is applied.
    fn transition(
        &self,
        id: TripId,
        from: &[CalcState],
        to: CalcState,
        at: DateTime<Utc>,
        audit: Option<UpdateDraft>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Take the trip for the job queued at `epoch`.
    ///
    /// Applied only from `Idle`/`Queued` while `calc_epoch` still equals
    /// `epoch`; a job left over from an earlier queue entry is rejected.
    fn lock(
        &self,
        id: TripId,
        epoch: u64,
        at: DateTime<Utc>,
        audit: Option<UpdateDraft>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// End the job holding `epoch`.
    ///
    /// # Returns
    /// `false` if the trip is no longer running under that epoch; nothing
    /// is written in that case.
    fn commit(
        &self,
        id: TripId,
        epoch: u64,
        completion: Completion,
        at: DateTime<Utc>,
        next_calc_at: DateTime<Utc>,
        audit: Option<UpdateDraft>,
    ) -> Result<bool, StoreError>;

    /// Force a stuck job to `Error`, guarded like `commit`
    fn force_error(
        &self,
        id: TripId,
        epoch: u64,
        at: DateTime<Utc>,
        next_calc_at: DateTime<Utc>,
        audit: UpdateDraft,
    ) -> Result<bool, StoreError>;

    /// Return a queued trip whose job was lost to `Idle`, due at `at`.
    /// Applied only if it has been queued since `queued_since`.
    fn release(
        &self,
        id: TripId,
        queued_since: DateTime<Utc>,
        at: DateTime<Utc>,
        audit: UpdateDraft,
    ) -> Result<bool, StoreError>;

    /// Append one audit entry
    fn append_update(
        &self,
        id: TripId,
        at: DateTime<Utc>,
        draft: UpdateDraft,
    ) -> Result<TripUpdate, StoreError>;

    /// Latest `limit` audit entries, newest first
    fn updates(&self, id: TripId, limit: usize) -> Result<Vec<TripUpdate>, StoreError>;

    /// Schedulable trips due at `now`, earliest first
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Trip>;

    /// Queued or running trips whose state is older than `cutoff`
    fn stale(&self, cutoff: DateTime<Utc>) -> Vec<Trip>;

    /// Apply a policy change with its audit entry
    fn update_policy(
        &self,
        id: TripId,
        patch: &PolicyPatch,
        at: DateTime<Utc>,
        audit: UpdateDraft,
    ) -> Result<Trip, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    trips: HashMap<TripId, Trip>,
    updates: HashMap<TripId, Vec<TripUpdate>>,
    next_update_id: u64,
}

impl Inner {
    fn trip_mut(&mut self, id: TripId) -> Result<&mut Trip, StoreError> {
        self.trips.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn push(&mut self, id: TripId, at: DateTime<Utc>, draft: UpdateDraft) -> TripUpdate {
        self.next_update_id += 1;
        let update = TripUpdate {
            id: self.next_update_id,
            trip_id: id,
            at,
            kind: draft.kind,
            payload: draft.payload,
        };
        self.updates.entry(id).or_default().push(update.clone());
        update
    }

    /// Running under `epoch`, or `None` if the job lost the trip
    fn owned(&mut self, id: TripId, epoch: u64) -> Result<Option<&mut Trip>, StoreError> {
        let trip = self.trip_mut(id)?;
        if trip.calc_state == CalcState::Running && trip.calc_epoch == epoch {
            Ok(Some(trip))
        } else {
            Ok(None)
        }
    }
}

fn set_state(trip: &mut Trip, to: CalcState, at: DateTime<Utc>) -> Result<(), StoreError> {
    validate_transition(trip.calc_state, to)?;
    trip.calc_state = to;
    trip.state_since = at;
    trip.updated_at = at;
    Ok(())
}

/// In-memory store behind one `RwLock`
#[derive(Debug, Default)]
pub struct MemoryTripStore {
    inner: RwLock<Inner>,
}

impl MemoryTripStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored trips
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().trips.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TripStore for MemoryTripStore {
    fn insert(&self, trip: Trip, audit: UpdateDraft) -> Result<Trip, StoreError> {
        let mut inner = self.inner.write();
        if inner.trips.contains_key(&trip.id) {
            return Err(StoreError::AlreadyExists(trip.id));
        }
        inner.push(trip.id, trip.created_at, audit);
        inner.trips.insert(trip.id, trip.clone());
        Ok(trip)
    }

    fn get(&self, id: TripId) -> Result<Trip, StoreError> {
        self.inner
            .read()
            .trips
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn list(&self) -> Vec<Trip> {
        let mut trips: Vec<Trip> = self.inner.read().trips.values().cloned().collect();
        trips.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        trips
    }

    fn delete(&self, id: TripId) -> Result<Trip, StoreError> {
        let mut inner = self.inner.write();
        let trip = inner.trips.remove(&id).ok_or(StoreError::NotFound(id))?;
        inner.updates.remove(&id);
        Ok(trip)
    }

    fn transition(
        &self,
        id: TripId,
        from: &[CalcState],
        to: CalcState,
        at: DateTime<Utc>,
        audit: Option<UpdateDraft>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.write();
        let trip = inner.trip_mut(id)?;
        if !from.contains(&trip.calc_state) {
            return Ok(TransitionOutcome::Rejected(trip.clone()));
        }

        set_state(trip, to, at)?;
        if to == CalcState::Running {
            trip.calc_epoch += 1;
        }
        let snapshot = trip.clone();
        if let Some(draft) = audit {
            inner.push(id, at, draft);
        }
        Ok(TransitionOutcome::Applied(snapshot))
    }

    fn lock(
        &self,
        id: TripId,
        epoch: u64,
        at: DateTime<Utc>,
        audit: Option<UpdateDraft>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.write();
        let trip = inner.trip_mut(id)?;
        if !CalcState::LOCKABLE.contains(&trip.calc_state) || trip.calc_epoch != epoch {
            return Ok(TransitionOutcome::Rejected(trip.clone()));
        }

        set_state(trip, CalcState::Running, at)?;
        trip.calc_epoch += 1;
        let snapshot = trip.clone();
        if let Some(draft) = audit {
            inner.push(id, at, draft);
        }
        Ok(TransitionOutcome::Applied(snapshot))
    }

    fn commit(
        &self,
        id: TripId,
        epoch: u64,
        completion: Completion,
        at: DateTime<Utc>,
        next_calc_at: DateTime<Utc>,
        audit: Option<UpdateDraft>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(trip) = inner.owned(id, epoch)? else {
            return Ok(false);
        };

        set_state(trip, completion.state(), at)?;
        trip.next_calc_at = Some(next_calc_at);
        match completion {
            Completion::Done(fields) => {
                fields.apply_to(trip);
                trip.last_calc_at = Some(at);
                trip.consecutive_failures = 0;
            }
            Completion::Error => trip.consecutive_failures += 1,
            Completion::BudgetLimited => {}
        }
        if let Some(draft) = audit {
            inner.push(id, at, draft);
        }
        Ok(true)
    }

    fn force_error(
        &self,
        id: TripId,
        epoch: u64,
        at: DateTime<Utc>,
        next_calc_at: DateTime<Utc>,
        audit: UpdateDraft,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(trip) = inner.owned(id, epoch)? else {
            return Ok(false);
        };

        set_state(trip, CalcState::Error, at)?;
        trip.next_calc_at = Some(next_calc_at);
        trip.consecutive_failures += 1;
        inner.push(id, at, audit);
        Ok(true)
    }

    fn release(
        &self,
        id: TripId,
        queued_since: DateTime<Utc>,
        at: DateTime<Utc>,
        audit: UpdateDraft,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let trip = inner.trip_mut(id)?;
        if trip.calc_state != CalcState::Queued || trip.state_since != queued_since {
            return Ok(false);
        }

        set_state(trip, CalcState::Idle, at)?;
        trip.next_calc_at = Some(at);
        inner.push(id, at, audit);
        Ok(true)
    }

    fn append_update(
        &self,
        id: TripId,
        at: DateTime<Utc>,
        draft: UpdateDraft,
    ) -> Result<TripUpdate, StoreError> {
        let mut inner = self.inner.write();
        if !inner.trips.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(inner.push(id, at, draft))
    }

    fn updates(&self, id: TripId, limit: usize) -> Result<Vec<TripUpdate>, StoreError> {
        let inner = self.inner.read();
        if !inner.trips.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(inner
            .updates
            .get(&id)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Trip> {
        let inner = self.inner.read();
        let mut due: Vec<&Trip> = inner
            .trips
            .values()
            .filter(|t| t.calc_state.is_schedulable())
            .filter(|t| t.next_calc_at.is_some_and(|at| at <= now))
            .collect();
        due.sort_by_key(|t| (t.next_calc_at, t.id));
        due.into_iter().take(limit).cloned().collect()
    }

    fn stale(&self, cutoff: DateTime<Utc>) -> Vec<Trip> {
        self.inner
            .read()
            .trips
            .values()
            .filter(|t| t.calc_state.is_in_flight() && t.state_since < cutoff)
            .cloned()
            .collect()
    }

    fn update_policy(
        &self,
        id: TripId,
        patch: &PolicyPatch,
        at: DateTime<Utc>,
        audit: UpdateDraft,
    ) -> Result<Trip, StoreError> {
        let mut inner = self.inner.write();
        let trip = inner.trip_mut(id)?;
        if let Some(mode) = patch.policy_mode {
            trip.policy_mode = mode;
        }
        if let Some(cap) = patch.route_daily_cap {
            trip.route_daily_cap = cap;
        }
        if let Some(cap) = patch.weather_daily_cap {
            trip.weather_daily_cap = cap;
        }
        trip.updated_at = at;
        let snapshot = trip.clone();
        inner.push(id, at, audit);
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use delayshield_core::{PolicyMode, UpdateKind, Waypoint};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-04T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn draft(kind: UpdateKind) -> UpdateDraft {
        UpdateDraft::new(kind, json!({}))
    }

    fn seeded() -> (MemoryTripStore, TripId) {
        let store = MemoryTripStore::new();
        let trip = Trip::new(
            now() + Duration::hours(8),
            vec![Waypoint::new(0.0, 0.0), Waypoint::new(1.0, 1.0)],
            PolicyMode::Balanced,
            15,
            30,
            now(),
        );
        let id = trip.id;
        store.insert(trip, draft(UpdateKind::Created)).unwrap();
        (store, id)
    }

    fn lock(store: &MemoryTripStore, id: TripId) -> TransitionOutcome {
        store
            .transition(id, &CalcState::RUNNABLE, CalcState::Running, now(), None)
            .unwrap()
    }

    fn fields(risk: u8) -> ComputedFields {
        ComputedFields {
            eta_at: now(),
            route_distance_m: 1_000,
            route_duration_s: 60,
            route_geometry: json!(null),
            buffer_minutes: 10,
            delay_risk_pct: risk,
            status: StatusBand::Yellow,
            suggestion: "s".into(),
            recommended_depart_at: None,
            why: "w".into(),
            customer_message: "m".into(),
        }
    }

    #[test]
    fn second_lock_is_rejected() {
        let (store, id) = seeded();
        assert!(lock(&store, id).is_applied());

        let second = lock(&store, id);
        assert!(!second.is_applied());
        assert_eq!(second.into_trip().calc_epoch, 1);
    }

    #[test]
    fn rejected_transition_writes_no_audit() {
        let (store, id) = seeded();
        lock(&store, id);
        store
            .transition(
                id,
                &CalcState::RUNNABLE,
                CalcState::Running,
                now(),
                Some(draft(UpdateKind::RecalcRunning)),
            )
            .unwrap();
        assert_eq!(store.updates(id, 10).unwrap().len(), 1);
    }

    #[test]
    fn stale_epoch_commit_is_refused() {
        let (store, id) = seeded();
        let first = lock(&store, id).into_trip();
        store
            .force_error(id, first.calc_epoch, now(), now(), draft(UpdateKind::WatchdogTimeout))
            .unwrap();
        lock(&store, id);

        let accepted = store
            .commit(id, first.calc_epoch, Completion::Done(fields(40)), now(), now(), None)
            .unwrap();
        assert!(!accepted);
        assert_eq!(store.get(id).unwrap().calc_state, CalcState::Running);
    }

    #[test]
    fn failed_runs_keep_last_assessment() {
        let (store, id) = seeded();
        let epoch = lock(&store, id).into_trip().calc_epoch;
        store
            .commit(id, epoch, Completion::Done(fields(40)), now(), now(), None)
            .unwrap();

        for completion in [Completion::Error, Completion::BudgetLimited] {
            let epoch = lock(&store, id).into_trip().calc_epoch;
            assert!(store
                .commit(id, epoch, completion, now(), now(), None)
                .unwrap());
            let trip = store.get(id).unwrap();
            assert_eq!(trip.delay_risk_pct, Some(40));
            assert_eq!(trip.status, Some(StatusBand::Yellow));
        }
        assert_eq!(store.get(id).unwrap().consecutive_failures, 1);
    }

    #[test]
    fn lock_takes_one_queue_entry_once() {
        let (store, id) = seeded();
        let queued = store
            .transition(id, &CalcState::SCHEDULABLE, CalcState::Queued, now(), None)
            .unwrap()
            .into_trip();

        let locked = store.lock(id, queued.calc_epoch, now(), None).unwrap();
        assert!(locked.is_applied());
        assert_eq!(locked.into_trip().calc_epoch, queued.calc_epoch + 1);
        assert!(!store.lock(id, queued.calc_epoch, now(), None).unwrap().is_applied());

        let epoch = store.get(id).unwrap().calc_epoch;
        store
            .commit(id, epoch, Completion::Done(fields(10)), now(), now(), None)
            .unwrap();
        // done is not lockable, whatever the epoch
        let after = store.lock(id, epoch, now(), None).unwrap();
        assert!(!after.is_applied());
        assert_eq!(after.into_trip().calc_state, CalcState::Done);
    }

    #[test]
    fn lock_rejects_job_from_earlier_entry() {
        let (store, id) = seeded();
        let first = store
            .transition(id, &CalcState::SCHEDULABLE, CalcState::Queued, now(), None)
            .unwrap()
            .into_trip();
        let epoch = lock(&store, id).into_trip().calc_epoch;
        store
            .commit(id, epoch, Completion::Done(fields(10)), now(), now(), None)
            .unwrap();
        store
            .transition(id, &CalcState::SCHEDULABLE, CalcState::Queued, now(), None)
            .unwrap();

        let stale = store
            .lock(id, first.calc_epoch, now(), Some(draft(UpdateKind::RecalcRunning)))
            .unwrap();
        assert!(!stale.is_applied());
        assert_eq!(store.get(id).unwrap().calc_state, CalcState::Queued);
        assert_eq!(store.updates(id, 10).unwrap().len(), 1);
    }

    #[test]
    fn release_requires_same_queue_entry() {
        let (store, id) = seeded();
        let queued = store
            .transition(id, &CalcState::SCHEDULABLE, CalcState::Queued, now(), None)
            .unwrap()
            .into_trip();

        let later = now() + Duration::minutes(1);
        assert!(!store
            .release(id, later, later, draft(UpdateKind::WatchdogTimeout))
            .unwrap());
        assert!(store
            .release(id, queued.state_since, later, draft(UpdateKind::WatchdogTimeout))
            .unwrap());

        let trip = store.get(id).unwrap();
        assert_eq!(trip.calc_state, CalcState::Idle);
        assert_eq!(trip.next_calc_at, Some(later));
    }

    #[test]
    fn delete_cascades_audit_log() {
        let (store, id) = seeded();
        store.delete(id).unwrap();
        assert!(matches!(store.updates(id, 10), Err(StoreError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn updates_are_newest_first_with_monotonic_ids() {
        let (store, id) = seeded();
        store
            .append_update(id, now(), draft(UpdateKind::BudgetConsume))
            .unwrap();
        let log = store.updates(id, 10).unwrap();
        assert_eq!(log[0].kind, UpdateKind::BudgetConsume);
        assert!(log[0].id > log[1].id);
        assert_eq!(store.updates(id, 1).unwrap().len(), 1);
    }

    #[test]
    fn due_skips_in_flight_and_future() {
        let (store, id) = seeded();
        assert!(store.due(now(), 10).is_empty(), "next_calc_at unset");

        let epoch = lock(&store, id).into_trip().calc_epoch;
        assert!(store.due(now() + Duration::days(1), 10).is_empty());

        let next = now() + Duration::minutes(15);
        store
            .commit(id, epoch, Completion::Error, now(), next, None)
            .unwrap();
        assert!(store.due(now(), 10).is_empty());
        assert_eq!(store.due(next, 10).len(), 1);
    }
}
