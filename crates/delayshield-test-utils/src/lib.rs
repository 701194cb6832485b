//! Testing utilities for DelayShield workspace
//!
//! Scriptable providers, the Belo Horizonte -> Sao Paulo fixture, and an
//! engine harness whose queue is drained by hand.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use delayshield_core::{EngineConfig, NewTrip, RouteMetrics, WeatherModifier, Waypoint};
use delayshield_engine::{
    BudgetLedger, Engine, JobOutcome, ProviderError, RecalcScheduler, RecalcWorker,
    RouteEstimator, TimeWindow, TripService, TripStore, Watchdog, WeatherReport,
    WeatherRiskAdjuster,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use delayshield_core::ManualClock;

pub const BH_SP_DISTANCE_M: u64 = 586_000;
pub const BH_SP_DURATION_S: u64 = 26_700;

/// Belo Horizonte -> Sao Paulo
pub fn bh_to_sp() -> Vec<Waypoint> {
    vec![
        Waypoint::new(-19.9191, -43.9386),
        Waypoint::new(-23.5505, -46.6333),
    ]
}

/// Fixed instant all harness clocks start at
pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-04T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn bh_sp_metrics() -> RouteMetrics {
    RouteMetrics {
        distance_m: BH_SP_DISTANCE_M,
        duration_s: BH_SP_DURATION_S,
        geometry: json!({"type": "LineString", "coordinates": [[-43.9386, -19.9191], [-46.6333, -23.5505]]}),
        provider: "fake".to_string(),
    }
}

/// Trip due `hours` after the harness start
pub fn trip_due_in(hours: i64) -> NewTrip {
    NewTrip::new(start_time() + Duration::hours(hours), bh_to_sp())
}

/// Defaults with millisecond retry backoff
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.initial_backoff_ms = 1;
    config.worker.max_backoff_ms = 4;
    config
}

/// Route estimator returning scripted results, then a fallback
#[derive(Debug)]
pub struct FakeRouteEstimator {
    script: Mutex<VecDeque<Result<RouteMetrics, ProviderError>>>,
    fallback: Mutex<Result<RouteMetrics, ProviderError>>,
    delay: Option<std::time::Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<Vec<Waypoint>>>,
}

impl FakeRouteEstimator {
    /// Always the Belo Horizonte -> Sao Paulo metrics
    pub fn bh_sp() -> Self {
        Self::with_fallback(Ok(bh_sp_metrics()))
    }

    /// Always fails with `error`
    pub fn failing(error: ProviderError) -> Self {
        Self::with_fallback(Err(error))
    }

    fn with_fallback(fallback: Result<RouteMetrics, ProviderError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue one result ahead of the fallback
    #[must_use]
    pub fn then(self, result: Result<RouteMetrics, ProviderError>) -> Self {
        self.script.lock().push_back(result);
        self
    }

    /// Sleep before answering
    #[must_use]
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace the fallback result
    pub fn set_fallback(&self, result: Result<RouteMetrics, ProviderError>) {
        *self.fallback.lock() = result;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls ever running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Waypoints of every call, in order
    pub fn seen(&self) -> Vec<Vec<Waypoint>> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl RouteEstimator for FakeRouteEstimator {
    fn name(&self) -> &str {
        "fake"
    }

    async fn estimate(&self, waypoints: &[Waypoint]) -> Result<RouteMetrics, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(waypoints.to_vec());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

/// Weather adjuster with a fixed answer
#[derive(Debug)]
pub struct FakeWeather {
    result: Result<f64, ProviderError>,
    calls: AtomicUsize,
}

impl FakeWeather {
    pub fn severity(severity: f64) -> Self {
        Self {
            result: Ok(severity),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            result: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WeatherRiskAdjuster for FakeWeather {
    async fn adjust(
        &self,
        _waypoints: &[Waypoint],
        _window: TimeWindow,
    ) -> Result<WeatherReport, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().map(|severity| WeatherReport {
            modifier: WeatherModifier::new(severity),
            details: json!({ "severity": severity }),
        })
    }
}

/// Engine on a manual clock with fake providers; nothing runs in the
/// background, jobs are processed by `drain`.
pub struct TestEngine {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub route: Arc<FakeRouteEstimator>,
    pub weather: Option<Arc<FakeWeather>>,
}

impl TestEngine {
    /// Fast config, Belo Horizonte -> Sao Paulo route, no weather
    pub fn new() -> Self {
        Self::build(fast_config(), FakeRouteEstimator::bh_sp(), None)
    }

    pub fn build(
        config: EngineConfig,
        route: FakeRouteEstimator,
        weather: Option<FakeWeather>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let route = Arc::new(route);
        let weather = weather.map(Arc::new);

        let mut builder = Engine::builder().clock(clock.clone());
        if let Some(weather) = &weather {
            builder = builder.weather(weather.clone());
        }
        let engine = builder.build(config, route.clone());

        Self {
            engine,
            clock,
            route,
            weather,
        }
    }

    pub fn service(&self) -> Arc<TripService> {
        self.engine.service()
    }

    pub fn store(&self) -> Arc<dyn TripStore> {
        self.engine.store()
    }

    pub fn ledger(&self) -> Arc<BudgetLedger> {
        self.engine.ledger()
    }

    pub fn scheduler(&self) -> Arc<RecalcScheduler> {
        self.engine.scheduler()
    }

    pub fn worker(&self) -> Arc<RecalcWorker> {
        self.engine.worker()
    }

    pub fn watchdog(&self) -> Arc<Watchdog> {
        self.engine.watchdog()
    }

    /// Process queued jobs one by one until the queue is empty
    pub async fn drain(&self) -> Vec<JobOutcome> {
        let (jobs, worker) = (self.engine.jobs(), self.engine.worker());
        let mut outcomes = Vec::new();
        while let Some(job) = jobs.try_recv().await {
            outcomes.push(worker.process(job).await);
        }
        outcomes
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
