//! YOLO Simulator
//!
//! Drives traders against the ledger and checks that money and holdings are
//! conserved.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yolo_ledger::{LedgerStore, MemoryStore, PgStore};
use yolo_trading::{TradingConfig, TradingService};

mod controller;
mod metrics;
mod scenario;
mod trader;

use controller::SimulationController;
use scenario::Scenario;

/// YOLO Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Load and scenario simulator for the YOLO trading ledger")]
struct Args {
    /// Number of simulated traders to create
    #[arg(short, long, default_value = "5")]
    traders: usize,

    /// Number of instruments to issue
    #[arg(short, long, default_value = "2")]
    instruments: usize,

    /// Scenario to run
    #[arg(short, long)]
    scenario: Option<String>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "10")]
    duration: u64,

    /// Concurrent operations in flight
    #[arg(short, long, default_value = "8")]
    concurrency: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// PostgreSQL URL; overrides DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    /// Emit JSON logs and a JSON report
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TradingConfig::from_env();
    if let Some(url) = &args.database_url {
        config.database.url = Some(url.clone());
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting YOLO Simulator");
    info!("Traders: {}", args.traders);
    info!("Instruments: {}", args.instruments);

    let (store, faults): (Arc<dyn LedgerStore>, Option<Arc<MemoryStore>>) =
        match &config.database.url {
            Some(url) => {
                info!("Using PostgreSQL store");
                let store = PgStore::connect(url, config.database.max_connections).await?;
                store.migrate().await?;
                (Arc::new(store), None)
            }
            None => {
                info!("Using in-memory store");
                let store = Arc::new(MemoryStore::new());
                (store.clone(), Some(store))
            }
        };

    let service = Arc::new(TradingService::new(store, config));
    let mut controller =
        SimulationController::new(service.clone(), faults, args.concurrency, args.seed);

    controller.initialize(args.traders, args.instruments).await?;

    if let Some(scenario_name) = &args.scenario {
        info!("Running scenario: {}", scenario_name);

        let scenario = Scenario::load(scenario_name, service.config().ledger.starting_balance)?;
        controller.run_scenario(&scenario).await?;
    } else {
        let duration = if args.duration > 0 {
            Some(Duration::from_secs(args.duration))
        } else {
            info!("Press Ctrl+C to stop");
            let running = controller.running();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    running.store(false, Ordering::SeqCst);
                }
            });
            None
        };

        controller.run(duration).await?;
    }

    let report = controller.report(args.scenario.clone()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!("Simulation complete");
        info!("Total operations: {}", report.simulation.total_operations);
        info!("Successful: {}", report.simulation.successful_operations);
        info!("Failed: {}", report.simulation.failed_operations);
        info!("Retries: {}", report.simulation.retries);
        info!("Success rate: {:.1}%", report.simulation.success_rate() * 100.0);
        info!("Average latency: {}ms", report.simulation.average_latency_ms());
        info!("p99 latency: {}ms", report.p99_latency_ms);
        info!("Throughput: {:.1} ops/s", report.throughput);
        for (kind, count) in &report.simulation.failures_by_kind {
            info!("  {}: {}", kind, count);
        }
        print!("{}", service.metrics().to_prometheus());
    }

    if !report.conservation.conserved {
        warn!("Ledger totals do not match settled trades");
        anyhow::bail!("Conservation check failed");
    }

    Ok(())
}
