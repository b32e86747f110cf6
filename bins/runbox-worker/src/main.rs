mod builder;
mod collector;
mod context;
mod engine;
mod error;
mod launcher;
mod reaper;
mod runtime;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use engine::SandboxEngine;
use runbox_common::config::{SandboxConfig, DEFAULT_CONFIG_PATH};
use runbox_common::types::ExecutionRequest;
use runtime::{ContainerRuntime, DockerRuntime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "runbox-worker")]
#[command(about = "Build and run a source file in a throwaway container", long_about = None)]
struct Args {
    /// Source files to execute, one execution each
    #[arg(short, long, required = true, num_args = 1..)]
    source: Vec<PathBuf>,

    /// Language profile from the sandbox config
    #[arg(short, long, default_value = "go")]
    language: String,

    /// Execution id (lowercase [a-z0-9_.-]); suffixed per source when several are given
    #[arg(long)]
    id: Option<String>,

    /// Sandbox configuration file [default: config/sandbox.json]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Give the container outbound network access
    #[arg(long, default_value = "false")]
    network: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();
    info!("Runbox worker booting...");

    let mut config = match &args.config {
        Some(path) => SandboxConfig::load(path)?,
        None => {
            if !Path::new(DEFAULT_CONFIG_PATH).exists() {
                warn!(path = DEFAULT_CONFIG_PATH, "Config file not found, using defaults");
            }
            SandboxConfig::load_default()?
        }
    };
    config.apply_env()?;
    info!("Configured languages: {:?}", config.list_languages());

    let profile = config.get_profile(&args.language).map_err(|e| {
        error!("Available languages: {:?}", config.list_languages());
        e
    })?;
    let descriptor = profile.load_descriptor()?;

    let mut requests = Vec::with_capacity(args.source.len());
    for (idx, path) in args.source.iter().enumerate() {
        let source_text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source file {}", path.display()))?;

        let request = match (&args.id, args.source.len()) {
            (Some(id), 1) => ExecutionRequest::with_id(id.clone(), source_text, descriptor.clone()),
            (Some(id), _) => {
                ExecutionRequest::with_id(format!("{}-{}", id, idx + 1), source_text, descriptor.clone())
            }
            (None, _) => ExecutionRequest::new(source_text, descriptor.clone()),
        }
        .source_name(profile.source_file.clone())
        .allow_network(args.network)
        .limits(profile.limits(&config.limits));

        request.validate_id().map_err(anyhow::Error::msg)?;
        requests.push(request);
    }

    // The endpoint is process-wide and read exactly once
    let runtime = DockerRuntime::connect(config.docker_host.as_deref())?;
    runtime
        .ping()
        .await
        .context("Docker daemon is not reachable")?;
    info!(
        endpoint = config.docker_host.as_deref().unwrap_or("local defaults"),
        "Connected to container runtime"
    );

    let engine = SandboxEngine::new(Arc::new(runtime), &config);

    // Ctrl-C aborts the in-flight phase; cleanup still runs
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, cancelling execution...");
            trigger.cancel();
        }
    });

    info!(
        executions = requests.len(),
        language = %profile.name,
        timeout_ms = engine.settings().execution_timeout.as_millis() as u64,
        "Submitting executions"
    );
    let results = engine.execute_batch(requests, cancel).await;

    let mut all_succeeded = true;
    for result in &results {
        all_succeeded &= result.is_success();
        println!("{}", serde_json::to_string_pretty(result)?);
    }

    if !all_succeeded {
        std::process::exit(1);
    }
    Ok(())
}
