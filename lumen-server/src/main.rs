mod api;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lumen_core::{ConfigStore, DeviceMap, FluxRuntime};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::state::AppState;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Lumen image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Accelerator ordinal to place models on; the least loaded GPU when omitted
    #[arg(long)]
    device: Option<usize>,

    /// Default model, overriding the settings file
    #[arg(long)]
    model: Option<String>,

    /// Keep weights in host memory between generations
    #[arg(long)]
    memory_resident: bool,

    /// Settings file
    #[arg(long, env = "LUMEN_CONFIG", default_value = "lumen.json")]
    config: PathBuf,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(args: &Args) {
    let default = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let layer = if args.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(filter())
            .boxed()
    };
    tracing_subscriber::registry().with(layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config_store = ConfigStore::new(&args.config);
    let mut config = config_store
        .load()
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(model) = &args.model {
        config.model_id = model.clone();
    }
    if args.memory_resident {
        config.memory_resident = true;
    }
    info!(
        model = %config.model_id,
        memory_resident = config.memory_resident,
        precision = %config.precision,
        idle_timeout_secs = config.idle.timeout_secs,
        "starting lumen"
    );

    let device_map = match args.device {
        Some(ordinal) => DeviceMap::new(args.cpu, ordinal),
        None if args.cpu => DeviceMap::ForceCpu,
        None => DeviceMap::auto(),
    };
    let runtime = Arc::new(FluxRuntime::new(device_map));
    let state = Arc::new(AppState::new(config, config_store, runtime)?);

    let shutdown = CancellationToken::new();
    let monitor = state.idle_monitor().await.spawn(shutdown.clone());

    let app = api::router(state.clone());

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "server started");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    monitor.await.context("idle monitor panicked")?;
    if state.residency.evict().await.unwrap_or(false) {
        info!("model unloaded");
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        shutdown.cancelled().await;
    }
    info!("shutting down");
    shutdown.cancel();
}
