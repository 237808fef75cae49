//! TradeWallet Simulator
//!
//! Drives the wallet service in-process: scripted scenarios with fault
//! injection, or seeded random load from many concurrent traders,
//! followed by a ledger audit.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradewallet_ledger::WriteMode;

mod controller;
mod metrics;
mod scenario;
mod trader;

use controller::SimulationController;
use scenario::Scenario;

/// TradeWallet Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "TradeWallet scenario runner and load generator")]
struct Args {
    /// Number of simulated traders to create
    #[arg(short, long, default_value = "3")]
    users: usize,

    /// Scenario to run instead of random load
    #[arg(short, long)]
    scenario: Option<String>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Random operations to issue
    #[arg(long, default_value = "1000")]
    operations: usize,

    /// Concurrent workers issuing random operations
    #[arg(long, default_value = "8")]
    concurrency: usize,

    /// Ledger write mode (atomic or compensating)
    #[arg(long, default_value = "atomic")]
    write_mode: WriteMode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting TradeWallet Simulator");
    info!("Traders: {}", args.users);
    info!("Write mode: {}", args.write_mode);

    let mut controller = SimulationController::new(args.users, args.seed, args.write_mode);
    controller.initialize().await?;

    if let Some(name) = &args.scenario {
        let scenario = Scenario::load(name)?;
        controller.run_scenario(&scenario).await?;
    } else {
        let elapsed = controller.run(args.operations, args.concurrency).await?;

        let metrics = controller.metrics().await;
        info!("Random load complete in {:.2}s", elapsed.as_secs_f64());
        info!("Total operations: {}", metrics.total_operations);
        info!("Completed: {}", metrics.completed);
        info!("Declined: {}", metrics.declined);
        info!("Failed: {}", metrics.failed);
        info!(
            "Latency avg/p50/p99: {}/{}/{}us",
            metrics.average_latency_us(),
            metrics.p50_latency_us(),
            metrics.p99_latency_us()
        );
        info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
        info!("Throughput: {:.0} ops/s", metrics.throughput(elapsed.as_secs_f64()));
    }

    let audit = controller.audit().await?;
    controller.shutdown().await?;

    info!(
        "Audited {} wallets, {} transactions",
        audit.wallets, audit.transactions
    );
    if !audit.is_clean() {
        for violation in &audit.violations {
            error!("{}", violation);
        }
        anyhow::bail!("Ledger audit found {} violations", audit.violations.len());
    }

    Ok(())
}
