//! Budget ledger for external provider calls
//!
//! Counters are keyed by (scope, provider, bucket) and only ever grow; a new
//! day or minute simply starts a new key at zero. Each key has its own lock,
//! so unrelated keys never contend. A request that needs several caps
//! (per-trip daily, global daily, global per-minute) locks all of its keys in
//! `UsageKey` order, checks every cap, and increments either all of them or
//! none.
//!
//! `prune` removes a counter only while holding its lock and marks it
//! retired; a grant that finds a retired counter starts over on a fresh one.

use crate::error::{BudgetDenial, LimitKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use delayshield_core::{BudgetConfig, Bucket, Provider, TripId, UsageKey, UsageScope};
use parking_lot::Mutex;
use std::sync::Arc;

/// Caps checked by a single-scope request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Calls per UTC day
    pub daily: u64,
    /// Calls per minute, if the scope has a minute cap
    pub per_minute: Option<u64>,
}

impl Capacity {
    /// Daily cap only
    #[inline]
    #[must_use]
    pub const fn daily(daily: u64) -> Self {
        Self {
            daily,
            per_minute: None,
        }
    }

    /// Daily and per-minute caps
    #[inline]
    #[must_use]
    pub const fn daily_and_minute(daily: u64, per_minute: u64) -> Self {
        Self {
            daily,
            per_minute: Some(per_minute),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Check {
    key: UsageKey,
    cap: u64,
    limit: LimitKind,
}

#[derive(Debug, Default)]
struct Counter {
    used: u64,
    /// Removed from the map by `prune`
    retired: bool,
}

type Slot = Arc<Mutex<Counter>>;

/// Atomic keyed call counters
#[derive(Debug)]
pub struct BudgetLedger {
    limits: BudgetConfig,
    counters: DashMap<UsageKey, Slot>,
}

impl BudgetLedger {
    /// Create ledger with global caps
    #[inline]
    #[must_use]
    pub fn new(limits: BudgetConfig) -> Self {
        Self {
            limits,
            counters: DashMap::new(),
        }
    }

    /// Global caps in use
    #[inline]
    #[must_use]
    pub fn limits(&self) -> &BudgetConfig {
        &self.limits
    }

    /// Consume one call for `scope` against `capacity` in the buckets
    /// containing `now`. Day and minute caps are checked together.
    pub fn try_consume(
        &self,
        scope: UsageScope,
        provider: Provider,
        capacity: Capacity,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetDenial> {
        let mut checks = Vec::with_capacity(2);
        Self::push_checks(&mut checks, scope, provider, capacity, now);
        self.grant(provider, checks)
    }

    /// Consume one call against the global caps and, when `trip` is given,
    /// that trip's daily cap. Denial by any cap leaves every counter as it was.
    pub fn authorize(
        &self,
        provider: Provider,
        trip: Option<(TripId, u32)>,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetDenial> {
        let limits = self.limits.limits(provider);
        let mut checks = Vec::with_capacity(3);
        Self::push_checks(
            &mut checks,
            UsageScope::Global,
            provider,
            Capacity::daily_and_minute(limits.daily, limits.per_minute),
            now,
        );
        if let Some((trip_id, cap)) = trip {
            Self::push_checks(
                &mut checks,
                UsageScope::Trip(trip_id),
                provider,
                Capacity::daily(u64::from(cap)),
                now,
            );
        }
        self.grant(provider, checks)
    }

    /// Current value of one counter
    #[must_use]
    pub fn used(&self, key: &UsageKey) -> u64 {
        // shard guard dropped before the counter lock
        let slot = self.counters.get(key).map(|entry| Arc::clone(entry.value()));
        slot.map_or(0, |slot| slot.lock().used)
    }

    /// Calls charged to `trip` for `provider` on the day containing `now`
    #[must_use]
    pub fn trip_used_today(&self, trip: TripId, provider: Provider, now: DateTime<Utc>) -> u64 {
        self.used(&UsageKey::new(
            UsageScope::Trip(trip),
            provider,
            Bucket::day(now),
        ))
    }

    /// Drop every counter owned by `trip`
    pub fn remove_trip(&self, trip: TripId) {
        self.counters
            .retain(|key, _| key.scope != UsageScope::Trip(trip));
    }

    /// Drop counters of buckets that ended before `now`. Live buckets are
    /// never touched. Returns how many counters were dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let (today, this_minute) = (Bucket::day(now), Bucket::minute(now));
        let expired: Vec<(UsageKey, Slot)> = self
            .counters
            .iter()
            .filter(|entry| match entry.key().bucket {
                Bucket::Day(_) => entry.key().bucket < today,
                Bucket::Minute(_) => entry.key().bucket < this_minute,
            })
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut dropped = 0;
        for (key, slot) in expired {
            let mut counter = slot.lock();
            let removed = self
                .counters
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot))
                .is_some();
            if removed {
                counter.retired = true;
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "pruned stale budget buckets");
        }
        dropped
    }

    /// Number of live counters
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// No counters yet
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn push_checks(
        checks: &mut Vec<Check>,
        scope: UsageScope,
        provider: Provider,
        capacity: Capacity,
        now: DateTime<Utc>,
    ) {
        let (daily, minute) = match scope {
            UsageScope::Global => (LimitKind::GlobalDaily, LimitKind::GlobalMinute),
            UsageScope::Trip(_) => (LimitKind::TripDaily, LimitKind::TripMinute),
        };
        checks.push(Check {
            key: UsageKey::new(scope, provider, Bucket::day(now)),
            cap: capacity.daily,
            limit: daily,
        });
        if let Some(per_minute) = capacity.per_minute {
            checks.push(Check {
                key: UsageKey::new(scope, provider, Bucket::minute(now)),
                cap: per_minute,
                limit: minute,
            });
        }
    }

    fn slot(&self, key: UsageKey) -> Slot {
        let entry = self.counters.entry(key).or_default();
        Arc::clone(&*entry)
    }

    /// All-or-nothing grant. Keys within one request are distinct by
    /// construction (scope and bucket kind differ).
    fn grant(&self, provider: Provider, mut checks: Vec<Check>) -> Result<(), BudgetDenial> {
        // Fixed lock order across all callers
        checks.sort_by_key(|c| c.key);

        loop {
            // Shard locks are released before any counter lock is taken
            let slots: Vec<Slot> = checks.iter().map(|c| self.slot(c.key)).collect();
            let mut guards: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();
            if guards.iter().any(|counter| counter.retired) {
                tracing::trace!(%provider, "counter pruned under a grant, retrying");
                continue;
            }

            for (check, counter) in checks.iter().zip(guards.iter()) {
                if counter.used >= check.cap {
                    tracing::debug!(%provider, limit = %check.limit, used = counter.used, cap = check.cap, "budget denied");
                    return Err(BudgetDenial {
                        provider,
                        limit: check.limit,
                        used: counter.used,
                        cap: check.cap,
                    });
                }
            }
            for counter in &mut guards {
                counter.used += 1;
            }
            return Ok(());
        }
    }
}
