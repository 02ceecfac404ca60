//! Simulate a distributed system that uses leases to partition work across
//! a fleet of workers, all sharing one in-memory store.
//!
//! Tasks spread evenly between workers; when a worker is killed, the rest
//! of the fleet takes over its leases within the failover window.
//!
//! Run with: cargo run --example simulate

use std::time::Duration;

use clap::Parser;
use tokio::time::sleep;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use leasehold::{Config, Coordinator, Lease, MemoryStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of workers in the fleet
    #[arg(long, default_value = "3")]
    workers: usize,

    /// Number of work units to create
    #[arg(long, default_value = "8")]
    tasks: usize,

    /// Seconds to run before killing the first worker
    #[arg(long, default_value = "45")]
    kill_after: u64,

    /// Seconds to keep running after the kill
    #[arg(long, default_value = "60")]
    observe_for: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let store = MemoryStore::new();

    // One worker doubles as the lease creator.
    let mut workers = Vec::new();
    for i in 0..args.workers {
        let mut config = Config::new("lease-table-demo");
        config.worker_id = format!("worker-{}", i);
        let mut coordinator = Coordinator::new(store.clone(), config)?;
        coordinator.start().await?;
        workers.push(coordinator);
    }

    for i in 0..args.tasks {
        let task = workers[0].create(Lease::new(format!("task-{}", i))).await?;
        info!(task = %task.key, owner = %task.owner, "created lease");
    }

    let report = |name: &str, held: Vec<Lease>| {
        let mut keys: Vec<String> = held.into_iter().map(|l| l.key).collect();
        keys.sort();
        info!(worker = name, held = keys.len(), keys = ?keys, "held leases");
    };

    sleep(Duration::from_secs(args.kill_after)).await;
    for (i, worker) in workers.iter().enumerate() {
        report(&format!("worker-{}", i), worker.held_leases().await);
    }

    info!("killing worker-0");
    workers.remove(0).stop().await;

    sleep(Duration::from_secs(args.observe_for)).await;
    info!("after failover:");
    for (i, worker) in workers.iter().enumerate() {
        report(&format!("worker-{}", i + 1), worker.held_leases().await);
    }

    for mut worker in workers {
        worker.stop().await;
    }
    Ok(())
}
