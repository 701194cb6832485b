use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use delayshield_core::{parse_deadline, EngineConfig, NewTrip, Trip, TripId, Waypoint};
use delayshield_engine::{
    Engine, FixedRouteEstimator, OpenRouteEstimator, OpenWeatherAdjuster, OsrmRouteEstimator,
    RouteEstimator,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Belo Horizonte -> Sao Paulo, used by `demo` and offline mode
const DEMO_ROUTE: [Waypoint; 2] = [
    Waypoint::new(-19.9191, -43.9386),
    Waypoint::new(-23.5505, -46.6333),
];
const DEMO_DISTANCE_M: u64 = 586_000;
const DEMO_DURATION_S: u64 = 26_700;

fn cli() -> Command {
    Command::new("delayshield")
        .version(env!("CARGO_PKG_VERSION"))
        .about("DelayShield trip recalculation engine")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("demo")
                .about("Score the Belo Horizonte -> Sao Paulo route offline")
                .arg(
                    Arg::new("deadline")
                        .long("deadline")
                        .action(ArgAction::Append)
                        .value_parser(parse_deadline)
                        .help("Extra absolute deadline (RFC 3339) to score"),
                ),
        )
        .subcommand(
            Command::new("preview")
                .about("Route metrics for ad-hoc waypoints")
                .arg(
                    Arg::new("waypoint")
                        .long("waypoint")
                        .short('w')
                        .action(ArgAction::Append)
                        .required(true)
                        .allow_hyphen_values(true)
                        .value_parser(value_parser!(Waypoint))
                        .help("Waypoint as lat,lon (repeat, in order)"),
                )
                .arg(
                    Arg::new("offline")
                        .long("offline")
                        .action(ArgAction::SetTrue)
                        .help("Use fixed demo metrics instead of a routing service"),
                ),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the engine over trips read from a JSON file")
                .arg(
                    Arg::new("trips")
                        .long("trips")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON array of trip submissions"),
                )
                .arg(
                    Arg::new("offline")
                        .long("offline")
                        .action(ArgAction::SetTrue)
                        .help("Use fixed demo metrics instead of a routing service"),
                )
                .arg(
                    Arg::new("poll-secs")
                        .long("poll-secs")
                        .default_value("5")
                        .value_parser(value_parser!(u64))
                        .help("Seconds between snapshot polls"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration as TOML"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    let config = EngineConfig::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
        .context("loading configuration")?;

    match matches.subcommand() {
        Some(("demo", args)) => demo(config, args).await,
        Some(("preview", args)) => preview(config, args).await,
        Some(("serve", args)) => serve(config, args).await,
        Some(("config", _)) => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("delayshield=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn demo(config: EngineConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let engine = Engine::builder().build(
        config,
        Arc::new(FixedRouteEstimator::new(DEMO_DISTANCE_M, DEMO_DURATION_S)),
    );
    let service = engine.service();
    let now = Utc::now();

    let mut deadlines: Vec<DateTime<Utc>> = [12, 8, 6]
        .into_iter()
        .map(|h| now + Duration::hours(h))
        .collect();
    if let Some(extra) = args.get_many::<DateTime<Utc>>("deadline") {
        deadlines.extend(extra.copied());
    }

    let mut ids = Vec::with_capacity(deadlines.len());
    for deadline in deadlines {
        ids.push(service.create(NewTrip::new(deadline, DEMO_ROUTE.to_vec()))?.id);
    }

    // Drive the queue inline; no background loops needed
    let (jobs, worker) = (engine.jobs(), engine.worker());
    while let Some(job) = jobs.try_recv().await {
        worker.process(job).await;
    }

    println!("Belo Horizonte -> Sao Paulo, {DEMO_DISTANCE_M} m, {DEMO_DURATION_S} s");
    for id in ids {
        print_trip(&service.get(id)?, now);
    }
    Ok(())
}

async fn preview(config: EngineConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let waypoints: Vec<Waypoint> = args
        .get_many::<Waypoint>("waypoint")
        .map(|w| w.copied().collect())
        .unwrap_or_default();
    let route = route_estimator(&config, args.get_flag("offline"))?;

    let engine = Engine::builder().build(config, route);
    let metrics = engine.service().preview(&waypoints).await?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

async fn serve(config: EngineConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let path = args
        .get_one::<PathBuf>("trips")
        .context("--trips is required")?;
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let submissions: Vec<NewTrip> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let poll_secs = args.get_one::<u64>("poll-secs").copied().unwrap_or(5);
    let poll = std::time::Duration::from_secs(poll_secs.max(1));

    let route = route_estimator(&config, args.get_flag("offline"))?;
    let mut builder = Engine::builder();
    if let Some(key_file) = &config.providers.openweather_api_key_file {
        match OpenWeatherAdjuster::from_key_file(key_file, config.worker.provider_timeout()) {
            Ok(weather) => builder = builder.weather(Arc::new(weather)),
            Err(e) => tracing::warn!(error = %e, "weather disabled"),
        }
    }

    let running = builder.build(config, route).start();
    let service = running.service();
    for (index, submission) in submissions.into_iter().enumerate() {
        match service.create(submission) {
            Ok(trip) => tracing::info!(index, trip_id = %trip.id, "trip submitted"),
            Err(e) => tracing::warn!(index, error = %e, "trip rejected"),
        }
    }

    let mut seen: HashMap<TripId, String> = HashMap::new();
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let now = Utc::now();
                for trip in service.list() {
                    let fingerprint = format!(
                        "{:?}{:?}{:?}",
                        trip.calc_state, trip.delay_risk_pct, trip.last_calc_at
                    );
                    if seen.get(&trip.id) != Some(&fingerprint) {
                        print_trip(&trip, now);
                        seen.insert(trip.id, fingerprint);
                    }
                }
            }
        }
    }

    running.shutdown().await;
    Ok(())
}

/// Fixed metrics offline, openrouteservice when its key loads, OSRM otherwise
fn route_estimator(config: &EngineConfig, offline: bool) -> anyhow::Result<Arc<dyn RouteEstimator>> {
    if offline {
        return Ok(Arc::new(FixedRouteEstimator::new(DEMO_DISTANCE_M, DEMO_DURATION_S)));
    }
    if let Some(key_file) = &config.providers.openrouteservice_api_key_file {
        match OpenRouteEstimator::from_key_file(key_file, config.worker.provider_timeout()) {
            Ok(ors) => return Ok(Arc::new(ors)),
            Err(e) => tracing::warn!(error = %e, "openrouteservice disabled, using osrm"),
        }
    }
    let osrm = OsrmRouteEstimator::new(
        config.providers.osrm_base_url.clone(),
        config.worker.provider_timeout(),
    )?;
    Ok(Arc::new(osrm))
}

fn print_trip(trip: &Trip, now: DateTime<Utc>) {
    let hours = (trip.deadline_at - now).num_minutes() as f64 / 60.0;
    match (trip.status, trip.delay_risk_pct) {
        (Some(status), Some(risk)) => println!(
            "{}  deadline {:+.1}h  {} {:<6} risk {:>3}%  buffer {:>5} min  [{}]  {}",
            trip.id,
            hours,
            status.symbol(),
            status,
            risk,
            trip.buffer_minutes.unwrap_or_default(),
            trip.calc_state,
            trip.suggestion.as_deref().unwrap_or_default(),
        ),
        _ => println!(
            "{}  deadline {:+.1}h  no assessment yet  [{}]",
            trip.id, hours, trip.calc_state
        ),
    }
}
