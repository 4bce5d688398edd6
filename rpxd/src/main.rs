use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rpx_core::config::{load_configs, Config, OutputKind, RuntimeConfig};
use rpx_core::observability::{init_logging, start_metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

mod capture;
mod emitter;
mod input;
mod limiter;
mod modifier;
mod output;
mod plugins;

use emitter::Emitter;
use modifier::{HttpModifier, Modifier};
use plugins::Registry;

#[derive(Parser)]
#[command(name = "rpxd", about = "rpx traffic capture and replay daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run {
        #[arg(short, long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,
    },
    Check {
        #[arg(short, long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run_with_runtime(config),
        Command::Check { config } => check(config),
    }
}

fn worker_threads(cfg: &RuntimeConfig) -> usize {
    cfg.worker_threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

fn max_blocking_threads(cfg: &RuntimeConfig) -> usize {
    cfg.max_blocking_threads
        .unwrap_or_else(|| worker_threads(cfg).saturating_mul(32).max(128))
}

fn run_with_runtime(config_paths: Vec<PathBuf>) -> Result<()> {
    let config = load_configs(&config_paths)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .worker_threads(worker_threads(&config.runtime))
        .max_blocking_threads(max_blocking_threads(&config.runtime))
        .enable_all();

    let runtime = builder.build()?;
    runtime.block_on(run(config))
}

/// Validates the config and resolves every plugin without opening sockets,
/// files or capture handles.
fn check(config_paths: Vec<PathBuf>) -> Result<()> {
    let config = load_configs(&config_paths)?;
    Registry::builtin().check(&config)?;
    modifiers(&config)?;
    for out in config.outputs.iter().filter(|o| o.kind == OutputKind::Http) {
        let url = out
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("output {} requires url", out.display_name()))?;
        output::client::HttpTarget::parse(url)
            .with_context(|| format!("output {}", out.display_name()))?;
    }
    println!("config ok");
    Ok(())
}

fn modifiers(config: &Config) -> Result<Vec<Arc<dyn Modifier>>> {
    let Some(cfg) = config.modifier.as_ref() else {
        return Ok(Vec::new());
    };
    let modifier = HttpModifier::from_config(cfg).context("modifier")?;
    Ok(vec![Arc::new(modifier)])
}

async fn run(config: Config) -> Result<()> {
    init_logging(&config.logging)?;
    info!(
        worker_threads = worker_threads(&config.runtime),
        max_blocking_threads = max_blocking_threads(&config.runtime),
        "runtime tuning"
    );
    if let Some(metrics) = &config.metrics {
        start_metrics(metrics)?;
    }

    let plugins = Registry::builtin().build(&config)?;
    let emitter = Emitter::new(config.emitter.fanout, modifiers(&config)?, plugins.outputs)?;

    let (quit_tx, quit_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("interrupt received, stopping");
        let _ = quit_tx.send(true);
    });

    info!(
        inputs = plugins.inputs.len(),
        derived = plugins.derived.len(),
        "rpxd started"
    );
    emitter
        .run(plugins.inputs, plugins.derived, quit_rx)
        .await?;
    info!("rpxd stopped");
    Ok(())
}
