//! Functional tests for the trip service and scheduling loop.
//!
//! Core guarantees exercised here:
//! - Invalid submissions are rejected before anything is stored or queued.
//! - Asking for a recalculation while one is pending is a no-op.
//! - The Belo Horizonte -> Sao Paulo route lands in the expected band for
//!   each deadline, and the due scan reruns red trips first.
//! - Deleting a trip drops its audit log and usage counters.

use chrono::Duration;
use delayshield_core::{
    Bucket, CalcState, Clock, PolicyMode, PolicyPatch, Provider, StatusBand, UpdateKind, UsageKey,
    UsageScope, ValidationError, Waypoint,
};
use delayshield_engine::{EngineError, JobOutcome, LimitKind};
use delayshield_test_utils::{
    bh_to_sp, fast_config, start_time, trip_due_in, FakeRouteEstimator, TestEngine,
};
use pretty_assertions::assert_eq;

/// Tenet: one waypoint is not a trip.
#[tokio::test]
async fn create_rejects_single_waypoint() {
    let h = TestEngine::new();
    let err = h
        .service()
        .create(delayshield_core::NewTrip::new(
            start_time() + Duration::hours(8),
            vec![Waypoint::new(-19.9, -43.9)],
        ))
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TooFewWaypoints { valid: 1 })
    ));
    assert!(h.service().list().is_empty());
    assert!(h.drain().await.is_empty());
}

#[tokio::test]
async fn create_rejects_zero_cap() {
    let h = TestEngine::new();
    let err = h
        .service()
        .create(trip_due_in(8).with_caps(0, 30))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::InvalidCap {
            provider: Provider::Route
        })
    ));
    assert!(h.service().list().is_empty());
}

#[tokio::test]
async fn create_applies_defaults() {
    let h = TestEngine::new();
    let trip = h.service().create(trip_due_in(8)).unwrap();

    assert_eq!(trip.policy_mode, PolicyMode::Balanced);
    assert_eq!(trip.route_daily_cap, 15);
    assert_eq!(trip.weather_daily_cap, 30);
    assert!(!trip.has_assessment());

    let created = h.store().updates(trip.id, 10).unwrap().pop().unwrap();
    assert_eq!(created.kind, UpdateKind::Created);
    assert_eq!(created.payload["waypoints_n"], 2);
}

/// Tenet: a pending recalculation absorbs further requests.
#[tokio::test]
async fn recalc_while_queued_is_noop() {
    let h = TestEngine::new();
    let trip = h.service().create(trip_due_in(12)).unwrap();

    for _ in 0..5 {
        let snapshot = h.service().recalc(trip.id).unwrap();
        assert_eq!(snapshot.calc_state, CalcState::Queued);
    }
    assert_eq!(h.drain().await.len(), 1);
    assert_eq!(h.route.calls(), 1);
}

#[tokio::test]
async fn recalc_unknown_trip_is_not_found() {
    let h = TestEngine::new();
    let err = h
        .service()
        .recalc(delayshield_core::TripId::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn bh_to_sp_bands_by_deadline() {
    let h = TestEngine::new();
    let green = h.service().create(trip_due_in(12)).unwrap().id;
    let yellow = h.service().create(trip_due_in(8)).unwrap().id;
    let red = h.service().create(trip_due_in(6)).unwrap().id;

    assert_eq!(
        h.drain().await,
        vec![
            JobOutcome::Done(StatusBand::Green),
            JobOutcome::Done(StatusBand::Yellow),
            JobOutcome::Done(StatusBand::Red),
        ]
    );

    let now = h.clock.now();
    let g = h.service().get(green).unwrap();
    assert_eq!((g.buffer_minutes, g.delay_risk_pct), (Some(255), Some(1)));
    assert_eq!(g.recommended_depart_at, None);
    assert_eq!(g.next_calc_at, Some(now + Duration::minutes(40)));

    let y = h.service().get(yellow).unwrap();
    assert_eq!((y.buffer_minutes, y.delay_risk_pct), (Some(15), Some(44)));
    assert_eq!(
        y.recommended_depart_at,
        Some(y.deadline_at - Duration::seconds(26_700) - Duration::minutes(20))
    );

    let r = h.service().get(red).unwrap();
    assert_eq!((r.buffer_minutes, r.delay_risk_pct), (Some(-105), Some(85)));
    assert_eq!(r.next_calc_at, Some(now + Duration::minutes(5)));
    assert!(r.suggestion.unwrap().starts_with("HIGH risk"));
}

#[tokio::test]
async fn due_scan_reruns_red_first() {
    let h = TestEngine::new();
    let green = h.service().create(trip_due_in(12)).unwrap().id;
    let red = h.service().create(trip_due_in(6)).unwrap().id;
    h.drain().await;

    h.clock.advance(Duration::minutes(5));
    assert_eq!(h.scheduler().scan_due().unwrap(), 1);
    assert_eq!(h.drain().await, vec![JobOutcome::Done(StatusBand::Red)]);

    let log = h.store().updates(red, 10).unwrap();
    let queued = log
        .iter()
        .find(|u| u.kind == UpdateKind::RecalcQueued)
        .unwrap();
    assert_eq!(queued.payload["by"], "scheduler");

    h.clock.advance(Duration::minutes(35));
    assert_eq!(h.scheduler().scan_due().unwrap(), 2);
    h.drain().await;
    assert_eq!(h.service().get(green).unwrap().last_calc_at, Some(h.clock.now()));
}

#[tokio::test]
async fn policy_patch_applies_to_next_run() {
    let h = TestEngine::new();
    let trip = h.service().create(trip_due_in(8)).unwrap();
    h.drain().await;
    assert_eq!(h.service().get(trip.id).unwrap().status, Some(StatusBand::Yellow));

    let patched = h
        .service()
        .update_policy(
            trip.id,
            PolicyPatch {
                policy_mode: Some(PolicyMode::Aggressive),
                ..PolicyPatch::default()
            },
        )
        .unwrap();
    assert_eq!(patched.policy_mode, PolicyMode::Aggressive);
    // stored assessment untouched until the next run
    assert_eq!(patched.status, Some(StatusBand::Yellow));

    let entry = &h.store().updates(trip.id, 1).unwrap()[0];
    assert_eq!(entry.kind, UpdateKind::PolicyUpdated);
    assert_eq!(entry.payload["policy_mode"], "aggressive");

    h.service().recalc(trip.id).unwrap();
    h.drain().await;
    let trip = h.service().get(trip.id).unwrap();
    // 10 min margin leaves a 25 min buffer on the flatter curve
    assert_eq!(trip.buffer_minutes, Some(25));
    assert_eq!(trip.status, Some(StatusBand::Yellow));
}

#[tokio::test]
async fn policy_patch_rejects_zero_cap() {
    let h = TestEngine::new();
    let trip = h.service().create(trip_due_in(8)).unwrap();
    let err = h
        .service()
        .update_policy(
            trip.id,
            PolicyPatch {
                weather_daily_cap: Some(0),
                ..PolicyPatch::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.service().get(trip.id).unwrap().weather_daily_cap, 30);
}

#[tokio::test]
async fn history_reports_usage_today() {
    let h = TestEngine::new();
    let trip = h.service().create(trip_due_in(12)).unwrap();
    h.drain().await;

    let history = h.service().history(trip.id, 2).unwrap();
    assert_eq!(history.updates.len(), 2);
    assert_eq!(history.updates[0].kind, UpdateKind::RecalcDone);

    let route = history
        .usage_today
        .iter()
        .find(|u| u.provider == Provider::Route)
        .unwrap();
    assert_eq!((route.calls, route.cap), (1, 15));
}

/// Tenet: delete cascades to the audit log and usage counters.
#[tokio::test]
async fn delete_cascades() {
    let h = TestEngine::new();
    let trip = h.service().create(trip_due_in(12)).unwrap();
    h.drain().await;
    let now = h.clock.now();
    assert_eq!(h.ledger().trip_used_today(trip.id, Provider::Route, now), 1);

    h.service().delete(trip.id).unwrap();

    assert!(matches!(
        h.service().get(trip.id),
        Err(EngineError::NotFound(_))
    ));
    assert!(h.store().updates(trip.id, 10).is_err());
    assert_eq!(h.ledger().trip_used_today(trip.id, Provider::Route, now), 0);
    let global = UsageKey::new(UsageScope::Global, Provider::Route, Bucket::day(now));
    assert_eq!(h.ledger().used(&global), 1);
}

/// Tenet: preview charges the global route budget only.
#[tokio::test]
async fn preview_uses_global_budget_only() {
    let mut config = fast_config();
    config.budgets.route.daily = 1;
    let h = TestEngine::build(config, FakeRouteEstimator::bh_sp(), None);

    let metrics = h.service().preview(&bh_to_sp()).await.unwrap();
    assert_eq!(metrics.distance_m, 586_000);
    assert!(h.service().list().is_empty());

    let now = h.clock.now();
    let global = UsageKey::new(UsageScope::Global, Provider::Route, Bucket::day(now));
    assert_eq!(h.ledger().used(&global), 1);

    let err = h.service().preview(&bh_to_sp()).await.unwrap_err();
    match err {
        EngineError::BudgetExceeded(denial) => assert_eq!(denial.limit, LimitKind::GlobalDaily),
        other => panic!("expected budget denial, got {other:?}"),
    }
    assert_eq!(h.route.calls(), 1);
}

#[tokio::test]
async fn preview_rejects_invalid_waypoints() {
    let h = TestEngine::new();
    let err = h
        .service()
        .preview(&[Waypoint::new(95.0, 0.0), Waypoint::new(0.0, 0.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.route.calls(), 0);
}

#[tokio::test]
async fn long_routes_are_clipped() {
    let h = TestEngine::new();
    let waypoints: Vec<Waypoint> = (0..25)
        .map(|i| Waypoint::new(-19.0 - f64::from(i) * 0.1, -44.0))
        .collect();
    h.service()
        .create(delayshield_core::NewTrip::new(
            start_time() + Duration::hours(12),
            waypoints.clone(),
        ))
        .unwrap();
    h.drain().await;

    let sent = h.route.seen().pop().unwrap();
    assert_eq!(sent.len(), 10);
    assert_eq!(sent.first(), waypoints.first());
    assert_eq!(sent.last(), waypoints.last());
}
