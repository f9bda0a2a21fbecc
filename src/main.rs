use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use tailgate::{AppState, ConfigFile, ProxyConfig, ProxyServer, ServeOutcome};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tailgate", version, about = "SOCKS5 and HTTP CONNECT proxy on a single port")]
struct Cli {
    /// Address to accept proxy clients on
    #[arg(long, default_value = "0.0.0.0:1080")]
    listen: SocketAddr,

    /// JSON file overriding the built-in timeouts and limits
    #[arg(long)]
    config: Option<PathBuf>,

    /// Close tunnels idle for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(cli: &Cli) -> anyhow::Result<ProxyConfig> {
    let mut config = ProxyConfig::default();
    if let Some(path) = &cli.config {
        let file = ConfigFile::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?;
        config = config.merge(file);
    }
    if let Some(secs) = cli.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = build_config(&cli)?;
    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    tracing::info!(
        "Starting tailgate {} at: {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr().unwrap_or(cli.listen)
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let server = ProxyServer::new(AppState::with_default_engine(config));
    match server.serve(listener, shutdown).await? {
        ServeOutcome::Drained => {}
        ServeOutcome::DrainTimedOut { remaining } => {
            tracing::warn!("exiting with {} connections still open", remaining);
        }
    }
    Ok(())
}
