mod cli;
mod handlers;

use std::collections::VecDeque;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use offload_core::{load_dotenv, PoolConfig, RuntimeFlags};
use offload_pool::{PoolError, TaskHandle, WorkerPool};

use crate::cli::CliArgs;
use crate::handlers::demo_registry;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(size) = args.size {
        config.size = size;
    }
    let cli_flags: RuntimeFlags = args.flags.iter().cloned().collect();
    config.flags.merge(&cli_flags);

    let registry = demo_registry().context("failed to register demo handlers")?;
    let pool = WorkerPool::new(config, registry).context("invalid pool config")?;
    pool.config().log_summary(pool.size());
    pool.init().context("failed to start worker pool")?;

    info!(tasks = args.tasks, task_type = %args.task_type, "submitting batch");
    let mut outstanding = VecDeque::with_capacity(args.tasks);
    let mut failed = 0usize;
    for n in 0..args.tasks {
        loop {
            let payload = serde_json::json!({ "n": n, "iterations": args.spin_iterations });
            match pool.submit(args.task_type.as_str(), payload) {
                Ok(handle) => {
                    outstanding.push_back(handle);
                    break;
                }
                // Bounded queue: wait for the oldest task, then retry.
                Err(PoolError::QueueFull { .. }) if !outstanding.is_empty() => {
                    if let Some(handle) = outstanding.pop_front() {
                        failed += usize::from(!finish(handle).await);
                    }
                }
                Err(e) => return Err(e).with_context(|| format!("failed to submit task {n}")),
            }
        }
    }

    for handle in outstanding {
        failed += usize::from(!finish(handle).await);
    }
    info!(succeeded = args.tasks - failed, failed, "batch finished");

    let stats = pool.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("failed to serialize stats")?
    );

    pool.shutdown().await;
    Ok(())
}

/// Await one task, logging a failure. Returns whether it succeeded.
async fn finish(handle: TaskHandle) -> bool {
    let id = handle.id();
    match handle.await {
        Ok(_) => true,
        Err(e) => {
            warn!(task_id = id, error = %e, "task failed");
            false
        }
    }
}

fn load_config(path: Option<&str>) -> Result<PoolConfig> {
    match path {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("failed to load pool config from '{path}'")),
        None => {
            let mut config = PoolConfig::default();
            config.apply_env_overrides();
            config.validate().context("invalid pool config")?;
            Ok(config)
        }
    }
}
