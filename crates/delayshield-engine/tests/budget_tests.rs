//! Functional tests for the budget ledger.
//!
//! Core guarantees exercised here:
//! - No counter ever exceeds its cap, whatever the request order.
//! - A denied request leaves every counter unchanged.
//! - Contending tasks are granted exactly the capacity, never more.

use chrono::{DateTime, Duration, Utc};
use delayshield_core::{
    BudgetConfig, Bucket, Provider, ProviderLimits, TripId, UsageKey, UsageScope,
};
use delayshield_engine::{BudgetLedger, LimitKind};
use delayshield_test_utils::start_time;
use proptest::prelude::*;
use std::sync::Arc;

fn ledger(daily: u64, per_minute: u64) -> BudgetLedger {
    BudgetLedger::new(BudgetConfig {
        route: ProviderLimits { daily, per_minute },
        weather: ProviderLimits { daily, per_minute },
    })
}

fn global(now: DateTime<Utc>) -> UsageKey {
    UsageKey::new(UsageScope::Global, Provider::Route, Bucket::day(now))
}

proptest! {
    /// Any sequence of requests across a few trips stays within every cap,
    /// and the global counter equals the number of grants.
    #[test]
    fn caps_hold_for_any_request_order(
        requests in prop::collection::vec((0usize..4, 0i64..180), 1..120),
        trip_cap in 1u32..8,
    ) {
        let ledger = ledger(40, 6);
        let trips: Vec<TripId> = (0..4).map(|_| TripId::new()).collect();
        let mut granted = 0u64;

        // seconds offsets sorted so the clock never runs backwards
        let mut requests = requests;
        requests.sort_by_key(|(_, offset)| *offset);
        for (trip, offset) in requests {
            let now = start_time() + Duration::seconds(offset);
            if ledger.authorize(Provider::Route, Some((trips[trip], trip_cap)), now).is_ok() {
                granted += 1;
            }
        }

        let now = start_time();
        prop_assert!(granted <= 40);
        prop_assert_eq!(ledger.used(&global(now)), granted);
        for trip in &trips {
            prop_assert!(ledger.trip_used_today(*trip, Provider::Route, now) <= u64::from(trip_cap));
        }
        for minute in 0..3 {
            let key = UsageKey::new(
                UsageScope::Global,
                Provider::Route,
                Bucket::minute(now + Duration::minutes(minute)),
            );
            prop_assert!(ledger.used(&key) <= 6);
        }
    }
}

#[test]
fn denial_leaves_counters_untouched() {
    let ledger = ledger(100, 100);
    let now = start_time();
    let trip = TripId::new();

    ledger.authorize(Provider::Route, Some((trip, 1)), now).unwrap();
    let denial = ledger
        .authorize(Provider::Route, Some((trip, 1)), now)
        .unwrap_err();

    assert_eq!(denial.limit, LimitKind::TripDaily);
    assert_eq!((denial.used, denial.cap), (1, 1));
    assert_eq!(ledger.used(&global(now)), 1);
    assert_eq!(ledger.trip_used_today(trip, Provider::Route, now), 1);
}

#[test]
fn new_day_starts_at_zero() {
    let ledger = ledger(1, 10);
    let now = start_time();
    ledger.authorize(Provider::Route, None, now).unwrap();
    assert!(ledger.authorize(Provider::Route, None, now).is_err());

    let tomorrow = now + Duration::days(1);
    ledger.authorize(Provider::Route, None, tomorrow).unwrap();
    assert_eq!(ledger.prune(tomorrow), 2);
    assert_eq!(ledger.used(&global(tomorrow)), 1);
}

#[test]
fn providers_are_budgeted_separately() {
    let ledger = ledger(1, 10);
    let now = start_time();
    ledger.authorize(Provider::Route, None, now).unwrap();
    ledger.authorize(Provider::Weather, None, now).unwrap();
    assert!(ledger.authorize(Provider::Weather, None, now).is_err());
}

/// 64 tasks race for one trip's last 10 calls.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn contended_trip_cap_is_exact() {
    let ledger = Arc::new(ledger(1_000, 1_000));
    let trip = TripId::new();
    let now = start_time();

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let ledger = Arc::clone(&ledger);
        tasks.push(tokio::spawn(async move {
            ledger.authorize(Provider::Route, Some((trip, 10)), now).is_ok()
        }));
    }

    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 10);
    assert_eq!(ledger.trip_used_today(trip, Provider::Route, now), 10);
    assert_eq!(ledger.used(&global(now)), 10);
}
