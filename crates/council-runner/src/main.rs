//! council-runner: drive a competitive council with simulated groups.

mod sim;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use council::state::SharedCouncilStore;
use council::{Council, CouncilConfig, CouncilEvent, EventBus, MemoryStore, Task};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use sim::{SimulatedBallots, SimulatedExecutor, SimulatedJudge};
use telemetry::{RoundTelemetry, RunSummary};

#[derive(Parser, Debug)]
#[command(name = "council-runner")]
#[command(version, about = "Run a competitive council against simulated groups")]
struct Args {
    /// Number of rounds to run
    #[arg(short, long, default_value_t = 20)]
    rounds: u64,

    /// TOML configuration file (COUNCIL_* variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RocksDB directory for durable state (needs the heavy-state feature)
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Append one JSONL telemetry line per round to this file
    #[arg(long)]
    telemetry_path: Option<PathBuf>,

    /// Summarize an existing telemetry file and exit
    #[arg(long)]
    report: Option<PathBuf>,

    /// Prompt prefix for generated tasks
    #[arg(long, default_value = "Simulated task")]
    task_prefix: String,

    /// Seed for the simulated executor and voters
    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[arg(long, default_value_t = 0.05)]
    agent_fault_rate: f64,

    #[arg(long, default_value_t = 0.02)]
    infra_fault_rate: f64,

    #[arg(long, default_value_t = 0.1)]
    abstain_rate: f64,

    /// Mean simulated group latency in milliseconds
    #[arg(long, default_value_t = 25)]
    latency_ms: u64,

    /// Attach an advisory judge
    #[arg(long)]
    judge: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Some(path) = &args.report {
        return report(path);
    }

    let config = CouncilConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let store = open_store(&args)?;

    info!(
        population = config.population_size,
        group_size = config.group_size,
        cull_every = config.cull_every,
        rounds = args.rounds,
        seed = args.seed,
        "Council runner starting"
    );

    let events = EventBus::new().shared();
    let logger = tokio::spawn(log_events(events.subscribe()));

    let executor = SimulatedExecutor {
        seed: args.seed,
        agent_fault_rate: args.agent_fault_rate,
        infra_fault_rate: args.infra_fault_rate,
        latency: Duration::from_millis(args.latency_ms),
    };
    let ballots = SimulatedBallots {
        seed: args.seed,
        abstain_rate: args.abstain_rate,
        noise: 0.15,
    };

    let mut builder = Council::builder(config, store, Arc::new(executor), Arc::new(ballots))
        .event_bus(events.clone());
    if args.judge {
        builder = builder.judge(Arc::new(SimulatedJudge));
    }
    let mut council = builder.open().context("Failed to open council")?;

    let mut summary = RunSummary::default();
    for _ in 0..args.rounds {
        let round_id = council.next_round_id();
        let task = Task::new(format!("{} #{}", args.task_prefix, round_id));

        let start = Instant::now();
        let result = council
            .run_round(&task)
            .await
            .with_context(|| format!("Round {} failed", round_id))?;

        let entry = RoundTelemetry::from_result(&result, start.elapsed());
        entry.emit();
        summary.record(&entry);
        if let Some(path) = &args.telemetry_path {
            telemetry::append_telemetry(&entry, path);
        }
    }

    summary.log();
    log_standings(&council, args.seed)?;

    drop(council);
    drop(events);
    if let Err(e) = logger.await {
        warn!("Event logger ended abnormally: {e}");
    }
    Ok(())
}

fn open_store(args: &Args) -> Result<SharedCouncilStore> {
    match &args.state_path {
        #[cfg(feature = "heavy-state")]
        Some(path) => {
            let store = council::RocksStore::open(path)
                .with_context(|| format!("Failed to open state at {}", path.display()))?;
            Ok(store.shared())
        }
        #[cfg(not(feature = "heavy-state"))]
        Some(_) => anyhow::bail!("--state-path requires the heavy-state feature"),
        None => Ok(MemoryStore::new().shared()),
    }
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<CouncilEvent>) {
    loop {
        match rx.recv().await {
            Ok(CouncilEvent::CouncillorRetired {
                councillor_id,
                lifetime_rounds,
                reason,
                ..
            }) => info!(%councillor_id, lifetime_rounds, %reason, "Councillor retired"),
            Ok(CouncilEvent::CommitFailed {
                round_id, stage, error, ..
            }) => warn!(round_id, %stage, %error, "Commit failed"),
            Ok(event) => debug!(
                event = event.event_type(),
                round_id = event.round_id(),
                "Council event"
            ),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_standings(council: &Council, seed: u64) -> Result<()> {
    let top = council
        .store()
        .councillors_by_performance(3)
        .context("Failed to read standings")?;
    for c in &top {
        info!(
            id = %c.id,
            specialization = %c.specialization,
            performance = c.performance_score,
            happiness = c.happiness,
            skill = sim::skill(seed, c.id),
            "Top councillor"
        );
    }

    let graveyard = council.population().graveyard();
    info!(
        population = council.population().len(),
        retired = graveyard.total_retirements(),
        average_lifetime = ?graveyard.average_lifetime(),
        "Final population"
    );
    Ok(())
}

fn report(path: &std::path::Path) -> Result<()> {
    let entries = telemetry::read_telemetry(path)
        .with_context(|| format!("Failed to read telemetry from {}", path.display()))?;
    let mut summary = RunSummary::default();
    for entry in &entries {
        summary.record(entry);
    }
    summary.log();
    Ok(())
}
