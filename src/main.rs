//! Door Game Session Bridge
//!
//! Subcommands:
//! - `serve`: run the WebSocket bridge and launch doors on demand
//! - `door`: relay a telnet caller on stdin/stdout to the bridge
//! - `sweep`: end session rows orphaned by a previous run, then exit
//!
//! Logs go to stderr; in `door` mode stdout is the caller's telnet stream.

use clap::{Args, Parser, Subcommand};
use door_bridge::{
    client, server, BridgeConfig, DoorClientConfig, SessionManager, SqliteSessionStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "door-bridge", version, about = "Door game session bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket bridge
    Serve(BridgeConfig),
    /// Relay a telnet caller (stdin/stdout) to the bridge
    Door(DoorClientConfig),
    /// End orphaned session rows and exit
    Sweep(SweepArgs),
}

#[derive(Args)]
struct SweepArgs {
    /// SQLite database holding session rows
    #[arg(long, env = "DOOR_DB_PATH", default_value = "door_sessions.db")]
    db_path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("door_bridge=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(config) => run_server(config),
        Command::Door(config) => run_door(config),
        Command::Sweep(args) => run_sweep(args),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

fn run_server(config: BridgeConfig) -> anyhow::Result<()> {
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    info!(
        ws = %config.ws_bind_addr(),
        ports = %format!("{}-{}", config.tcp_port_base, config.tcp_port_max),
        emulator = ?config.emulator,
        "Starting door bridge"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let store = Arc::new(SqliteSessionStore::open(&config.db_path)?);
        let bind_addr = config.ws_bind_addr();
        let manager = SessionManager::new(config, store);
        manager.recover_orphans()?;

        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("bind {bind_addr} failed: {e}"))?;

        let cancel = CancellationToken::new();
        let cancel_for_signal = cancel.clone();
        tokio::spawn(async move {
            if wait_for_shutdown_signal().await.is_ok() {
                info!("Shutdown signal received");
            } else {
                error!("Shutdown signal handler failed; stopping");
            }
            cancel_for_signal.cancel();
        });

        server::serve(manager.clone(), listener, cancel).await?;

        let stats = manager.stats();
        info!(
            live = stats.live,
            active = stats.active,
            grace = stats.grace,
            "Tearing down sessions"
        );
        manager.shutdown_all().await;
        info!("Server stopped");
        Ok::<_, anyhow::Error>(())
    })
}

fn run_door(config: DoorClientConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        client::run_door_client(&config, tokio::io::stdin(), tokio::io::stdout()).await
    })?;
    Ok(())
}

fn run_sweep(args: SweepArgs) -> anyhow::Result<()> {
    let store = SqliteSessionStore::open(&args.db_path)?;
    let ended = door_bridge::SessionStore::end_orphaned(&store)?;
    info!(db = %args.db_path.display(), ended, "Sweep complete");
    Ok(())
}
