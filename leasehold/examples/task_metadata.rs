//! A worker loop that records progress as lease metadata: each time it
//! finishes a unit of work it updates a status field, a timestamp, and a
//! string set of results, then deletes finished tasks from the table.
//!
//! Run with: cargo run --example task_metadata

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use leasehold::{Config, Coordinator, Lease, MemoryStore, SetType};

const STATUS: &str = "taskStatus";
const DONE: i64 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of tasks to create
    #[arg(long, default_value = "4")]
    tasks: usize,

    /// Seconds between handling passes
    #[arg(long, default_value = "10")]
    handle_every: u64,

    /// Total seconds to run
    #[arg(long, default_value = "90")]
    run_for: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let store = MemoryStore::new();

    let mut config = Config::new("lease-table-demo");
    config.worker_id = "metadata-worker".to_string();
    let mut leaser = Coordinator::new(store, config)?;
    leaser.start().await?;

    for i in 0..args.tasks {
        let mut task = Lease::new(format!("task-{}", i));
        task.set("created_at", unix_now());
        task.set(STATUS, 0);
        let task = leaser.create(task).await?;
        info!(task = %task.key, "lease created");
    }

    // Held copies are pinned at acquisition, so progress is tracked here
    // and persisted through the guarded update.
    let mut progress: HashMap<String, i64> = HashMap::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.run_for);
    while tokio::time::Instant::now() < deadline {
        sleep(Duration::from_secs(args.handle_every)).await;
        for mut task in leaser.held_leases().await {
            let status = *progress.get(&task.key).unwrap_or(&0);
            if status >= DONE {
                info!(task = %task.key, "finished, deleting");
                match leaser.delete(&task).await {
                    Ok(()) => {
                        progress.remove(&task.key);
                    }
                    Err(err) => error!(task = %task.key, error = %err, "delete failed"),
                }
                continue;
            }

            // HANDLE YOUR TASK/JOB HERE
            sleep(Duration::from_secs(1)).await;

            task.set(STATUS, status + 1);
            task.set("last_update", unix_now());
            task.set_as("results", json!(["200", "500", "404"]), SetType::StringSet)?;
            match leaser.update(&task).await {
                Ok(updated) => {
                    progress.insert(updated.key.clone(), status + 1);
                    info!(task = %updated.key, status = status + 1, "updated lease")
                }
                Err(err) => error!(task = %task.key, error = %err, "update failed"),
            }
        }
    }

    leaser.stop().await;
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
