//! Engine wiring and background loops
//!
//! `EngineBuilder::build` wires every component around one store, ledger and
//! clock. `Engine::start` spawns the worker pool, the due scan, the watchdog
//! and a budget pruner; all stop on one `watch` shutdown signal.

use crate::budget::BudgetLedger;
use crate::providers::{RouteEstimator, WeatherRiskAdjuster};
use crate::scheduler::{JobReceiver, RecalcScheduler};
use crate::service::TripService;
use crate::store::{MemoryTripStore, TripStore};
use crate::watchdog::Watchdog;
use crate::worker::RecalcWorker;
use delayshield_core::{Clock, EngineConfig, RiskScorer, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Assembled engine, not yet running
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn TripStore>,
    ledger: Arc<BudgetLedger>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<RecalcScheduler>,
    worker: Arc<RecalcWorker>,
    watchdog: Arc<Watchdog>,
    service: Arc<TripService>,
    jobs: JobReceiver,
}

/// Optional parts of an engine
#[derive(Debug, Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn TripStore>>,
    clock: Option<Arc<dyn Clock>>,
    weather: Option<Arc<dyn WeatherRiskAdjuster>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn TripStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn weather(mut self, weather: Arc<dyn WeatherRiskAdjuster>) -> Self {
        self.weather = Some(weather);
        self
    }

    /// Assemble with `route` as the route provider.
    /// Defaults: in-memory store, wall clock, no weather.
    #[must_use]
    pub fn build(self, config: EngineConfig, route: Arc<dyn RouteEstimator>) -> Engine {
        let store: Arc<dyn TripStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryTripStore::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ledger = Arc::new(BudgetLedger::new(config.budgets.clone()));

        let (scheduler, jobs) =
            RecalcScheduler::new(store.clone(), clock.clone(), config.schedule.clone());
        let scheduler = Arc::new(scheduler);

        let worker = Arc::new(RecalcWorker::new(
            store.clone(),
            ledger.clone(),
            route.clone(),
            self.weather,
            RiskScorer::new(config.risk.clone()),
            scheduler.clone(),
            clock.clone(),
            config.worker.clone(),
            config.providers.max_route_waypoints,
        ));
        let watchdog = Arc::new(Watchdog::new(
            store.clone(),
            scheduler.clone(),
            clock.clone(),
            config.worker.stuck_after(),
            Duration::from_secs(config.worker.watchdog_interval_secs),
        ));
        let service = Arc::new(TripService::new(
            store.clone(),
            ledger.clone(),
            scheduler.clone(),
            route,
            clock.clone(),
            config.trip_defaults.clone(),
            config.providers.max_route_waypoints,
            config.worker.provider_timeout(),
        ));

        Engine {
            config,
            store,
            ledger,
            clock,
            scheduler,
            worker,
            watchdog,
            service,
            jobs,
        }
    }
}

impl Engine {
    /// Start a builder
    #[inline]
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    #[must_use]
    pub fn service(&self) -> Arc<TripService> {
        Arc::clone(&self.service)
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn TripStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn ledger(&self) -> Arc<BudgetLedger> {
        Arc::clone(&self.ledger)
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<RecalcScheduler> {
        Arc::clone(&self.scheduler)
    }

    #[must_use]
    pub fn worker(&self) -> Arc<RecalcWorker> {
        Arc::clone(&self.worker)
    }

    #[must_use]
    pub fn watchdog(&self) -> Arc<Watchdog> {
        Arc::clone(&self.watchdog)
    }

    /// Job queue, for driving workers by hand
    #[must_use]
    pub fn jobs(&self) -> JobReceiver {
        self.jobs.clone()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the background loops. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(self) -> RunningEngine {
        let (shutdown, signal) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.config.worker.concurrency + 3);

        for _ in 0..self.config.worker.concurrency {
            let worker = Arc::clone(&self.worker);
            handles.push(tokio::spawn(worker.run(self.jobs.clone(), signal.clone())));
        }
        handles.push(tokio::spawn(
            Arc::clone(&self.scheduler).run(signal.clone()),
        ));
        handles.push(tokio::spawn(Arc::clone(&self.watchdog).run(signal.clone())));
        handles.push(tokio::spawn(prune_loop(
            Arc::clone(&self.ledger),
            Arc::clone(&self.clock),
            signal,
        )));

        tracing::info!(workers = self.config.worker.concurrency, "engine started");
        RunningEngine {
            service: self.service,
            shutdown,
            handles,
        }
    }
}

/// Engine with background loops running
#[derive(Debug)]
pub struct RunningEngine {
    service: Arc<TripService>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningEngine {
    #[must_use]
    pub fn service(&self) -> Arc<TripService> {
        Arc::clone(&self.service)
    }

    /// Signal every loop and wait for them. Jobs in progress finish first.
    pub async fn shutdown(self) {
        // receivers may already be gone
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "engine task failed");
            }
        }
        tracing::info!("engine stopped");
    }
}

async fn prune_loop(
    ledger: Arc<BudgetLedger>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                ledger.prune(clock.now());
            }
        }
    }
}
