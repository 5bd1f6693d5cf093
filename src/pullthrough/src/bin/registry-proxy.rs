use clap::Parser;
use pullthrough::{start_server, Config};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "registry-proxy", version, about = "Pull-through registry proxy with job service dashboard")]
struct Args {
    /// YAML configuration file; built-in defaults when omitted
    #[arg(short, long, env = "REGISTRY_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Local registry storage directory, overrides storage.directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Bind address, overrides server.bind_address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let storage_dir = args
        .storage_dir
        .unwrap_or_else(|| PathBuf::from(&config.storage.directory));

    tracing::info!(
        bind = %config.server.bind_address,
        port = config.server.port,
        storage = %storage_dir.display(),
        config_file = ?args.config,
        "Starting registry proxy"
    );

    let shutdown = CancellationToken::new();
    let handle = start_server(storage_dir, config, shutdown.clone()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.cancel();
    handle.await?;
    Ok(())
}
