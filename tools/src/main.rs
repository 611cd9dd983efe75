//! bingo-runner: headless batch runner for the bingo-event simulator.
//!
//! Usage:
//!   bingo-runner local    --catalog data/sample_catalog.json --event evt-winter --runs 200 [--seed S] [--db runs.db]
//!   bingo-runner start    --catalog data/sample_catalog.json --event evt-winter --runs 200 --db runs.db
//!   bingo-runner worker   --db runs.db [--worker-index 0 --worker-count 2] [--drain]
//!   bingo-runner summary  --db runs.db --batch <batch-id>
//!   bingo-runner simulate --catalog data/sample_catalog.json --event evt-winter --seed S_0
//!
//! Every subcommand accepts --config <pipeline.json>; flags override it.

use anyhow::{bail, Context, Result};
use bingo_sim_core::{
    assembly::SnapshotAssembler,
    buffer::ResultBuffer,
    cache::SnapshotCache,
    cancel::CancelFlag,
    catalog::JsonCatalog,
    config::PipelineConfig,
    distribution::{BrokerPublisher, MessageBroker, SqliteBroker},
    engine::SimEngine,
    finalize::{BatchFinalizer, FinalizerScanner},
    pipeline::{BatchOrchestrator, BatchSummary},
    store::SimStore,
    types::ExecutionMode,
    worker::{run_distributed_worker, BatchWorker},
};
use std::env;
use std::sync::Arc;

#[derive(serde::Serialize)]
struct TeamLine {
    team_id: String,
    team_name: String,
    mean_points: f64,
    min_points: u32,
    max_points: u32,
    mean_tiles: f64,
    mean_row_reached: f64,
    win_rate: f64,
}

#[derive(serde::Serialize)]
struct SummaryOut {
    batch_id: String,
    event_id: String,
    status: String,
    error_message: Option<String>,
    seed: String,
    runs_completed: u32,
    runs_failed: u32,
    runs_open: u32,
    teams: Vec<TeamLine>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let config = load_config(&args)?;

    match command {
        "local" => cmd_local(&args, config),
        "start" => cmd_start(&args, config),
        "worker" => cmd_worker(&args, config),
        "summary" => cmd_summary(&args),
        "simulate" => cmd_simulate(&args),
        _ => {
            println!("bingo-runner <local|start|worker|summary|simulate> [flags]");
            Ok(())
        }
    }
}

fn load_config(args: &[String]) -> Result<PipelineConfig> {
    let mut config = match str_arg(args, "--config") {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.consumer_count = parse_arg(args, "--consumers", config.consumer_count);
    config.worker_count = parse_arg(args, "--worker-count", config.worker_count);
    config.max_in_flight = parse_arg(args, "--max-in-flight", config.max_in_flight);
    config.message_batch_size = parse_arg(args, "--message-batch-size", config.message_batch_size);
    if let Some(index) = str_arg(args, "--worker-index") {
        config.worker_index = Some(index.parse().context("--worker-index")?);
    }
    config.validate()?;
    Ok(config)
}

fn open_store(args: &[String], default: &str) -> Result<SimStore> {
    let db = str_arg(args, "--db").unwrap_or(default);
    let store = if db == ":memory:" {
        SimStore::in_memory()?
    } else {
        SimStore::open(db)?
    };
    store.migrate()?;
    Ok(store)
}

fn required<'a>(args: &'a [String], flag: &str) -> Result<&'a str> {
    match str_arg(args, flag) {
        Some(v) => Ok(v),
        None => bail!("missing required flag {flag}"),
    }
}

fn cmd_local(args: &[String], config: PipelineConfig) -> Result<()> {
    let catalog = JsonCatalog::load(required(args, "--catalog")?)?;
    let event_id = required(args, "--event")?;
    let runs = parse_arg(args, "--runs", 100u32);
    let store = open_store(args, ":memory:")?;

    let orchestrator = BatchOrchestrator::new(store, &catalog, config);
    let summary = orchestrator.run_local_batch(event_id, runs, str_arg(args, "--seed"), &CancelFlag::new())?;
    print_summary(&summary, args.iter().any(|a| a == "--json"))
}

fn cmd_start(args: &[String], config: PipelineConfig) -> Result<()> {
    let catalog = JsonCatalog::load(required(args, "--catalog")?)?;
    let event_id = required(args, "--event")?;
    let runs = parse_arg(args, "--runs", 100u32);
    let store = open_store(args, "runs.db")?;
    if store.path().is_none() {
        bail!("distributed batches need a database file (--db)");
    }

    let broker: Arc<dyn MessageBroker> = Arc::new(SqliteBroker::new(
        store.clone(),
        std::time::Duration::from_millis(config.visibility_timeout_ms),
    ));
    let publisher = BrokerPublisher::new(broker, config.message_batch_size, config.worker_count);
    let orchestrator = BatchOrchestrator::new(store, &catalog, config);
    let started = orchestrator.start_batch(
        event_id,
        runs,
        str_arg(args, "--seed"),
        ExecutionMode::Distributed,
        &publisher,
    )?;
    println!("batch_id: {}", started.batch_id);
    println!("seed:     {}", started.seed);
    println!("runs:     {}", started.run_ids.len());
    Ok(())
}

fn cmd_worker(args: &[String], config: PipelineConfig) -> Result<()> {
    let store = open_store(args, "runs.db")?;
    let drain = args.iter().any(|a| a == "--drain");
    let cancel = CancelFlag::new();

    let finalizer = BatchFinalizer::new(store.clone());
    let buffer = Arc::new(ResultBuffer::new(store.reopen()?, finalizer.clone(), &config));
    let cache = Arc::new(SnapshotCache::new(
        config.snapshot_cache_ttl(),
        config.snapshot_cache_capacity,
    ));
    let worker = BatchWorker::new(store.reopen()?, cache, Arc::clone(&buffer), &config, cancel.clone());
    let broker = SqliteBroker::new(
        store.reopen()?,
        std::time::Duration::from_millis(config.visibility_timeout_ms),
    );

    let background = CancelFlag::new();
    let sweeper = Arc::clone(&buffer).spawn_sweeper(config.sweep_interval(), background.clone());
    let scanner = FinalizerScanner::new(store.reopen()?, finalizer.clone(), config.scanner_interval())
        .spawn(background.clone());

    log::info!(
        "worker started (index={:?} of {}, in-flight={})",
        config.worker_index,
        config.worker_count,
        config.max_in_flight
    );
    let stats = run_distributed_worker(
        &worker,
        &broker,
        config.max_in_flight,
        config.poll_interval(),
        drain,
        &cancel,
    );

    background.cancel();
    let _ = sweeper.join();
    let _ = scanner.join();
    buffer.flush()?;
    FinalizerScanner::new(store, finalizer, config.scanner_interval()).scan_once()?;

    let stats = stats?;
    println!("=== WORKER SUMMARY ===");
    println!("  messages:       {}", stats.messages);
    println!("  dropped:        {}", stats.dropped);
    println!("  runs completed: {}", stats.runs_completed);
    println!("  runs failed:    {}", stats.runs_failed);
    Ok(())
}

fn cmd_summary(args: &[String]) -> Result<()> {
    let store = open_store(args, "runs.db")?;
    let batch_id = required(args, "--batch")?;
    let catalog = JsonCatalog::default();
    let orchestrator = BatchOrchestrator::new(store, &catalog, PipelineConfig::default());
    let summary = orchestrator.batch_summary(batch_id)?;
    print_summary(&summary, args.iter().any(|a| a == "--json"))
}

fn cmd_simulate(args: &[String]) -> Result<()> {
    let catalog = JsonCatalog::load(required(args, "--catalog")?)?;
    let event_id = required(args, "--event")?;
    let seed = str_arg(args, "--seed").unwrap_or("seed_0");
    let (_, json) = SnapshotAssembler::new(&catalog).assemble_json(event_id)?;
    let results = SimEngine::execute(&json, seed)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn print_summary(summary: &BatchSummary, as_json: bool) -> Result<()> {
    let out = SummaryOut {
        batch_id: summary.batch.id.clone(),
        event_id: summary.batch.event_id.clone(),
        status: summary.batch.status.as_str().to_string(),
        error_message: summary.batch.error_message.clone(),
        seed: summary.batch.seed.clone(),
        runs_completed: summary.counts.completed,
        runs_failed: summary.counts.failed,
        runs_open: summary.counts.pending + summary.counts.running,
        teams: summary
            .aggregates
            .iter()
            .map(|a| TeamLine {
                team_id: a.team_id.clone(),
                team_name: a.team_name.clone(),
                mean_points: a.mean_points,
                min_points: a.min_points,
                max_points: a.max_points,
                mean_tiles: a.mean_tiles,
                mean_row_reached: a.mean_row_reached,
                win_rate: a.win_rate,
            })
            .collect(),
    };
    if as_json {
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("=== BATCH SUMMARY ===");
    println!("  batch_id:  {}", out.batch_id);
    println!("  event:     {}", out.event_id);
    println!("  status:    {}", out.status);
    if let Some(msg) = &out.error_message {
        println!("  error:     {msg}");
    }
    println!("  seed:      {}", out.seed);
    println!("  completed: {}", out.runs_completed);
    println!("  failed:    {}", out.runs_failed);
    println!("  open:      {}", out.runs_open);
    println!();
    println!("=== TEAMS ===");
    if out.teams.is_empty() {
        println!("  (No aggregates yet)");
    }
    for t in &out.teams {
        println!(
            "  {:<20} | Points: {:.1} ({}-{}) | Tiles: {:.1} | Row: {:.2} | Win: {:.1}%",
            t.team_name,
            t.mean_points,
            t.min_points,
            t.max_points,
            t.mean_tiles,
            t.mean_row_reached,
            t.win_rate * 100.0
        );
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn str_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
