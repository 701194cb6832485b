//! Concurrency and budget stress tests
//!
//! Run with: cargo test --package delayshield-engine --test stress_test

use delayshield_core::{
    Bucket, CalcState, Clock, Provider, StatusBand, UpdateKind, UsageKey, UsageScope,
};
use delayshield_engine::JobOutcome;
use delayshield_test_utils::{fast_config, trip_due_in, FakeRouteEstimator, TestEngine};
use std::sync::Arc;
use std::time::Duration as StdDuration;

#[tokio::test]
async fn global_daily_cap_holds_across_trips() {
    let mut config = fast_config();
    config.budgets.route.daily = 10;
    config.budgets.route.per_minute = 100;
    let h = TestEngine::build(config, FakeRouteEstimator::bh_sp(), None);

    for _ in 0..30 {
        h.service().create(trip_due_in(12)).unwrap();
    }
    let outcomes = h.drain().await;

    let done = outcomes
        .iter()
        .filter(|o| **o == JobOutcome::Done(StatusBand::Green))
        .count();
    let limited = outcomes
        .iter()
        .filter(|o| **o == JobOutcome::BudgetLimited)
        .count();
    assert_eq!((done, limited), (10, 20));
    assert_eq!(h.route.calls(), 10);

    let key = UsageKey::new(
        UsageScope::Global,
        Provider::Route,
        Bucket::day(h.clock.now()),
    );
    assert_eq!(h.ledger().used(&key), 10);
}

#[tokio::test]
async fn per_minute_cap_resets_next_minute() {
    let mut config = fast_config();
    config.budgets.route.per_minute = 2;
    let h = TestEngine::build(config, FakeRouteEstimator::bh_sp(), None);

    let ids: Vec<_> = (0..3)
        .map(|_| h.service().create(trip_due_in(12)).unwrap().id)
        .collect();
    let outcomes = h.drain().await;
    assert_eq!(outcomes[2], JobOutcome::BudgetLimited);
    assert_eq!(
        h.service().get(ids[2]).unwrap().calc_state,
        CalcState::BudgetLimited
    );

    h.clock.advance(chrono::Duration::minutes(10));
    assert_eq!(h.scheduler().scan_due().unwrap(), 1);
    assert_eq!(h.drain().await, vec![JobOutcome::Done(StatusBand::Green)]);
}

/// Many workers and a flood of requests still run one job per trip at a
/// time, and every route call is accounted for.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_running_job_per_trip() {
    let mut config = fast_config();
    config.worker.concurrency = 8;
    config.trip_defaults.route_daily_cap = 1_000;
    config.budgets.route.per_minute = 1_000;
    config.budgets.route.daily = 1_000;
    let route = FakeRouteEstimator::bh_sp().with_delay(StdDuration::from_millis(5));
    let h = TestEngine::build(config, route, None);

    let trip = h.service().create(trip_due_in(12)).unwrap();
    let route = Arc::clone(&h.route);
    let store = h.store();
    let running = h.engine.start();
    let service = running.service();

    let mut requests = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        requests.push(tokio::spawn(async move {
            for _ in 0..25 {
                service.recalc(trip.id).unwrap();
                tokio::time::sleep(StdDuration::from_millis(1)).await;
            }
        }));
    }
    for request in requests {
        request.await.unwrap();
    }

    // let in-flight jobs settle
    let mut settled = false;
    for _ in 0..200 {
        if !store.get(trip.id).unwrap().calc_state.is_in_flight() {
            settled = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    running.shutdown().await;
    assert!(settled, "trip never left queued/running");

    assert_eq!(route.max_in_flight(), 1);
    let log = store.updates(trip.id, usize::MAX).unwrap();
    let count = |kind| log.iter().filter(|u| u.kind == kind).count();
    assert_eq!(count(UpdateKind::RecalcRunning), route.calls());
    assert_eq!(count(UpdateKind::RecalcDone), route.calls());
    assert_eq!(count(UpdateKind::RecalcQueued), route.calls());
}
