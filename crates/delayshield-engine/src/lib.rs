//! DelayShield Engine - trip recalculation runtime
//!
//! Keeps delay risk of tracked trips current:
//! - Budgets external provider calls per trip and globally
//! - Schedules recomputation by severity and policy
//! - Runs jobs under a per-trip advisory lock with bounded retries
//! - Never blanks a trip's last good assessment on failure
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use delayshield_engine::{Engine, FixedRouteEstimator};
//! use delayshield_core::{EngineConfig, NewTrip, Waypoint};
//!
//! # async fn example() -> Result<(), delayshield_engine::EngineError> {
//! let engine = Engine::builder().build(
//!     EngineConfig::default(),
//!     Arc::new(FixedRouteEstimator::new(586_000, 26_700)),
//! );
//! let running = engine.start();
//!
//! let trip = running.service().create(NewTrip::new(
//!     Utc::now() + Duration::hours(8),
//!     vec![Waypoint::new(-19.9191, -43.9386), Waypoint::new(-23.5505, -46.6333)],
//! ))?;
//! println!("{} is {}", trip.id, trip.calc_state);
//!
//! running.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod budget;
pub mod error;
pub mod providers;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod watchdog;
pub mod worker;

pub use budget::{BudgetLedger, Capacity};
pub use error::{BudgetDenial, EngineError, LimitKind, ProviderError, StoreError};
pub use providers::{
    FixedRouteEstimator, OpenRouteEstimator, OpenWeatherAdjuster, OsrmRouteEstimator,
    RouteEstimator, TimeWindow, WeatherReport, WeatherRiskAdjuster,
};
pub use runtime::{Engine, EngineBuilder, RunningEngine};
pub use scheduler::{JobReceiver, RecalcJob, RecalcScheduler, Trigger};
pub use service::TripService;
pub use store::{Completion, ComputedFields, MemoryTripStore, TransitionOutcome, TripStore};
pub use watchdog::{SweepReport, Watchdog};
pub use worker::{JobOutcome, RecalcWorker};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running the engine
    pub use crate::{
        Engine, EngineError, FixedRouteEstimator, JobOutcome, OsrmRouteEstimator, RouteEstimator,
        TripService, TripStore, WeatherRiskAdjuster,
    };
    pub use delayshield_core::{
        CalcState, EngineConfig, NewTrip, PolicyMode, PolicyPatch, StatusBand, Trip, TripId,
        Waypoint,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
