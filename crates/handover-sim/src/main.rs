//! Handover Simulation CLI
//!
//! Attaches a population of fixed terminals under a Walker Delta LEO shell,
//! drives the prediction engine cycle by cycle for both access policies and
//! reports handover counts, outages and measurement events.
//!
//! Usage:
//!   handover-sim --terminals 50 --minutes 10 --output sim_report.json

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use handover_engine::measurement::EventKind;
use handover_engine::{
    AccessPolicy, Engine, EngineConfig, EngineStats, EventDetector, LinkQualityEstimator,
    MappingTable, PathLossEstimator, SignalSample, TerminalReport,
};
use orbital_mechanics::transforms::haversine_km;
use orbital_mechanics::walker::WalkerDelta;
use orbital_mechanics::{GeodeticPosition, OrbitOracle, WalkerOracle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Downlink EIRP used to turn path loss into a received power
const SIM_EIRP_DBM: f64 = 74.0;

#[derive(Parser, Debug)]
#[command(
    name = "handover-sim",
    about = "Simulate LEO handover prediction for flexible and consistent terminals"
)]
struct Args {
    /// Number of terminals to attach
    #[arg(short = 'n', long, default_value_t = 20)]
    terminals: usize,

    /// Simulated duration in minutes
    #[arg(short, long, default_value_t = 10)]
    minutes: i64,

    /// Engine config JSON (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the look-ahead interval in ms
    #[arg(long)]
    delta_t_ms: Option<u64>,

    /// Override the geographic block size in km
    #[arg(long)]
    block_km: Option<f64>,

    /// Rank candidates by RF path loss instead of elevation
    #[arg(long)]
    path_loss: bool,

    /// Write the per-policy report as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct PolicyReport {
    policy: AccessPolicy,
    terminals: usize,
    cycles: u64,
    handovers: u64,
    outage_cycles: u64,
    events: BTreeMap<String, u64>,
    mean_refinement_iterations: f64,
    stats: EngineStats,
}

/// Terminals spread over the shell's coverage band, deterministic per index
fn terminal_positions(count: usize, max_latitude: f64) -> Vec<GeodeticPosition> {
    (0..count)
        .map(|i| {
            let lat = -max_latitude + 2.0 * max_latitude * (i as f64 + 0.5) / count as f64;
            let lon = (i as f64 * 137.508).rem_euclid(360.0) - 180.0;
            GeodeticPosition::ground(lat, lon)
        })
        .collect()
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides();

    if let Some(ms) = args.delta_t_ms {
        config.delta_t_ms = ms;
    }
    if let Some(km) = args.block_km {
        config.block_size_km = km;
    }
    config.validate()?;
    Ok(config)
}

/// Received power for every satellite the table mentions for each terminal
fn sample_signals(
    table: &MappingTable,
    positions: &BTreeMap<String, GeodeticPosition>,
    oracle: &dyn OrbitOracle,
    estimator: &PathLossEstimator,
    at: DateTime<Utc>,
) -> Vec<SignalSample> {
    let mut samples = Vec::new();
    for entry in table.entries() {
        let Some(ground) = positions.get(&entry.terminal_id) else {
            continue;
        };
        let mut satellites: Vec<&String> = entry.current_satellite.iter().collect();
        if let Some(next) = &entry.next_satellite {
            if entry.current_satellite.as_ref() != Some(next) {
                satellites.push(next);
            }
        }
        for sat in satellites {
            let (Ok(quality), Ok(sub)) = (
                estimator.quality(ground, sat, at),
                oracle.position(sat, at),
            ) else {
                continue;
            };
            samples.push(SignalSample {
                terminal_id: entry.terminal_id.clone(),
                satellite_id: sat.clone(),
                rsrp_dbm: SIM_EIRP_DBM + quality,
                ground_distance_km: Some(haversine_km(
                    ground.latitude,
                    ground.longitude,
                    sub.latitude,
                    sub.longitude,
                )),
            });
        }
    }
    samples
}

async fn simulate(
    policy: AccessPolicy,
    config: &EngineConfig,
    oracle: Arc<WalkerOracle>,
    use_path_loss: bool,
    positions: &BTreeMap<String, GeodeticPosition>,
    start: DateTime<Utc>,
    minutes: i64,
) -> Result<PolicyReport> {
    info!("{}", "-".repeat(60));
    info!("Policy: {}", policy);

    let dyn_oracle: Arc<dyn OrbitOracle> = oracle.clone();
    let path_loss = PathLossEstimator::new(dyn_oracle.clone());
    let estimator: Option<Arc<dyn LinkQualityEstimator>> = if use_path_loss {
        Some(Arc::new(PathLossEstimator::new(dyn_oracle.clone())))
    } else {
        None
    };

    let engine = Engine::spawn(config.clone(), dyn_oracle.clone(), estimator)?;
    for (id, position) in positions {
        engine
            .report(TerminalReport::fixed(id, *position, policy, start))
            .await?;
    }

    let mut detector = EventDetector::new(config.measurement.clone());
    let mut events: BTreeMap<String, u64> = BTreeMap::new();
    let mut serving: BTreeMap<String, Option<String>> = BTreeMap::new();
    let mut handovers = 0u64;
    let mut outage_cycles = 0u64;
    let mut cycles = 0u64;

    let end = start + Duration::minutes(minutes);
    let mut t = start;
    while t < end {
        engine.run_cycle(t).await?;
        cycles += 1;

        let table = engine.snapshot();
        for entry in table.entries() {
            let previous = serving.insert(entry.terminal_id.clone(), entry.current_satellite.clone());
            if let Some(Some(prev)) = previous {
                if entry.current_satellite.as_ref().map(|c| c != &prev).unwrap_or(false) {
                    debug!(
                        "{} handed over {} -> {:?} at {}",
                        entry.terminal_id, prev, entry.current_satellite, t
                    );
                    handovers += 1;
                }
            }
        }

        let samples = sample_signals(&table, positions, oracle.as_ref(), &path_loss, t);
        let output = detector.evaluate(&table, &samples, t);
        outage_cycles += output.outage_risk.len() as u64;
        for event in output.events {
            *events.entry(event.kind.to_string()).or_default() += 1;
        }

        t += config.delta_t();
    }

    let stats = engine.stats().await?;
    engine.shutdown().await?;

    info!(
        "{}: {} handovers over {} cycles, {} outage terminal-cycles, {:.1} mean refinement iterations",
        policy,
        handovers,
        cycles,
        outage_cycles,
        stats.mean_refinement_iterations()
    );
    for kind in [EventKind::A3, EventKind::A4, EventKind::A5, EventKind::D2] {
        let count = events.get(&kind.to_string()).copied().unwrap_or(0);
        info!("  {} events: {}", kind, count);
    }

    Ok(PolicyReport {
        policy,
        terminals: positions.len(),
        cycles,
        handovers,
        outage_cycles,
        events,
        mean_refinement_iterations: stats.mean_refinement_iterations(),
        stats,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("handover_engine={0},handover_sim={0}", level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("{}", "=".repeat(60));
    info!("LEO Handover Prediction Simulator");
    info!("{}", "=".repeat(60));

    let config = load_config(&args)?;
    let walker = WalkerDelta::leo_shell();
    let start = Utc::now();
    let oracle = Arc::new(WalkerOracle::new("leo", walker.clone(), start));

    info!(
        "Shell: {} satellites in {} planes at {} km, {}° inclination",
        walker.total_satellites, walker.planes, walker.altitude_km, walker.inclination_deg
    );

    // keep terminals a little inside the inclination band
    let band = (walker.inclination_deg - 5.0).max(0.0);
    let positions: BTreeMap<String, GeodeticPosition> = terminal_positions(args.terminals, band)
        .into_iter()
        .enumerate()
        .map(|(i, p)| (format!("UT-{:04}", i), p))
        .collect();
    info!("Attached {} terminals, simulating {} min", positions.len(), args.minutes);

    let mut reports = Vec::new();
    for policy in [AccessPolicy::Flexible, AccessPolicy::Consistent] {
        let report = simulate(
            policy,
            &config,
            oracle.clone(),
            args.path_loss,
            &positions,
            start,
            args.minutes,
        )
        .await?;
        reports.push(report);
    }

    if let Some(path) = &args.output {
        info!("Writing report to {:?}", path);
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &reports)?;
    }

    // Summary
    info!("{}", "=".repeat(60));
    info!("SUMMARY");
    info!("{}", "=".repeat(60));
    for r in &reports {
        info!(
            "  {:10} | {:6} handovers | {:6} outages | {:.1} iterations/refinement",
            r.policy.as_str(),
            r.handovers,
            r.outage_cycles,
            r.mean_refinement_iterations
        );
    }

    Ok(())
}
