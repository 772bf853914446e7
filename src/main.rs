//! Skylight GW - Rust implementation
//!
//! Relays printer state from Moonraker-style upstreams to WebSocket
//! subscribers and drives the LED display mode.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use skylight_gw::config::AppConfig;
use skylight_gw::display::{local_tree, DisplayWatcher, LoggingModeSink};
use skylight_gw::server::{start_server, ServerState};
use skylight_gw::state::{StateHubHandle, StateTree};
use skylight_gw::upstream::{Connector, UpstreamClient, WsConnector};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Skylight Gateway - printer state relay and LED display driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "skylight.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration as YAML and exit
    #[arg(long)]
    print_default_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    if args.print_default_config {
        print!("{}", AppConfig::default().to_yaml()?);
        return Ok(());
    }

    init_logging(&args.log_level, args.log_format)?;

    info!("Starting Skylight GW v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = if Path::new(&args.config).exists() {
        AppConfig::load(&args.config).await?
    } else {
        warn!("{} not found, using default configuration", args.config);
        AppConfig::default()
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;

    run_app(config, shutdown_signal()).await?;

    info!("Skylight GW shutdown complete");
    Ok(())
}

async fn run_app(
    config: AppConfig,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let cancel = CancellationToken::new();

    let initial = config
        .display
        .as_ref()
        .map(local_tree)
        .unwrap_or_else(StateTree::new);
    let hub = StateHubHandle::spawn(initial);

    let connector: Arc<dyn Connector> = Arc::new(WsConnector);
    let mut tasks = Vec::new();
    for upstream in &config.upstreams {
        let client = UpstreamClient::new(
            upstream.clone(),
            hub.clone(),
            Arc::clone(&connector),
            cancel.clone(),
        );
        client.on_status(Arc::new(|name, state| {
            debug!("Upstream '{}' is now {:?}", name, state);
        }));
        tasks.push(client.spawn());
    }
    info!("{} upstream client(s) started", config.upstreams.len());

    if let Some(display) = config.display.clone().filter(|d| d.enabled) {
        let watcher = DisplayWatcher::new(
            display,
            hub.clone(),
            Arc::new(LoggingModeSink::default()),
            cancel.clone(),
        );
        tasks.push(watcher.spawn());
    }

    let server_state = Arc::new(ServerState {
        hub: hub.clone(),
        cancel: cancel.clone(),
    });
    let host = config.server.host.clone();
    let port = config.server.port;
    let mut server = tokio::spawn(async move { start_server(server_state, &host, port).await });

    // Stop on Ctrl-C, or early if the server fails (e.g. port in use)
    let early_exit = tokio::select! {
        _ = shutdown => None,
        result = &mut server => Some(result),
    };

    info!("Stopping...");
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    let server_result = match early_exit {
        Some(result) => result,
        None => server.await,
    };
    hub.shutdown();

    server_result.context("Server task panicked")??;
    Ok(())
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init(),
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
