use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use pincer::auth::AllowAll;
use pincer::bus::{MemoryBus, MessageBus};
use pincer::config::{uri_scheme, Config};
use pincer::logging::{init_logging, LogConfig};
use pincer::server::{self, AppState};
use pincer::store::{DataStore, MemoryStore};

#[derive(Parser)]
#[command(name = "pincer", version, about = "Remote-shell session bridge")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "PINCER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge (the default)
    Start,
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Start) => run_server(cli.config.as_deref()).await,
        Some(Command::Version) => {
            println!("pincer {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server(config_path: Option<&std::path::Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    init_logging(if config.debug_log {
        LogConfig::development()
    } else {
        LogConfig::production()
    })?;

    let store = build_store(&config)?;
    // refuse to start against an unreachable store
    store.ping().await?;
    let bus = build_bus(&config)?;

    let config = Arc::new(config);
    let state = AppState::new(store, bus, Arc::new(AllowAll), Arc::clone(&config));
    let shutdown = state.shutdown.clone();
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("pincer v{}", env!("CARGO_PKG_VERSION"));
    info!("listening on {}", listener.local_addr()?);
    info!(bus = %config.bus_uri, store = %config.store_uri, "collaborators wired");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let reason = await_shutdown_trigger().await;
    info!("shutdown signal received ({reason})");
    shutdown.cancel();

    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(joined) => joined??,
        Err(_) => warn!(
            "connections still draining after {:?}, forcing shutdown",
            config.shutdown_grace
        ),
    }
    info!("bridge shut down");
    Ok(())
}

fn build_store(config: &Config) -> Result<Arc<dyn DataStore>, Box<dyn std::error::Error>> {
    match uri_scheme(&config.store_uri) {
        Some("mem") => Ok(Arc::new(MemoryStore::new())),
        _ => Err(format!("unsupported store uri: {}", config.store_uri).into()),
    }
}

fn build_bus(config: &Config) -> Result<Arc<dyn MessageBus>, Box<dyn std::error::Error>> {
    match uri_scheme(&config.bus_uri) {
        Some("mem") => Ok(Arc::new(MemoryBus::new())),
        _ => Err(format!("unsupported bus uri: {}", config.bus_uri).into()),
    }
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for
/// the logs.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}; falling back to Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
