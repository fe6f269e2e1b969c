//! Daemon entry point: wiring, signal handling, graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cadence_core::Config;
use cadenced::server::{create_router, AppState};
use cadenced::tools::report::ReportSuccessTool;
use cadenced::tools::Tool;
use cadenced::{ductile, provider, runner, storage, tools};

/// How long shutdown waits for the worker to finish the in-flight run.
const SHUTDOWN_CEILING: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "cadenced", version, about = "Autonomous agent orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon.
    Start {
        /// Path to the YAML config file.
        #[arg(long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Print the version.
    Version,
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Version => {
            println!("cadenced {}", env!("CARGO_PKG_VERSION"));
        }
        Command::Start { config } => {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create runtime: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = runtime.block_on(start(&config)) {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn start(config_path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load(config_path)?;

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.service.log_level.clone())),
        )
        .init();

    info!(config = %config_path.display(), "starting cadenced");

    let storage = storage::Storage::new(&cfg.database.path).await?;
    storage.migrate_embedded().await?;
    let storage = Arc::new(storage);

    let gateway = Arc::new(ductile::Client::new(
        &cfg.ductile.base_url,
        &cfg.ductile.token,
    ));

    let chat_model = provider::new_chat_model(&cfg.llm)?;

    let mut base_tools: Vec<Arc<dyn Tool>> =
        ductile::build_ductile_tools(Arc::clone(&gateway), &cfg.ductile.allowlist);
    base_tools.push(Arc::new(ReportSuccessTool));
    base_tools.extend(tools::sys::build_sys_tools());

    let agent_runner = Arc::new(runner::Runner::new(
        Arc::clone(&storage),
        chat_model,
        base_tools,
        Some(Arc::clone(&gateway)),
        cfg.agent.clone(),
        cfg.ductile.callback_url.clone(),
    ));

    if let Err(e) = agent_runner.recover_runs().await {
        error!(error = %e, "run recovery failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = runner::spawn_worker(Arc::clone(&agent_runner), shutdown_rx.clone());

    let state = Arc::new(AppState {
        storage,
        runner: agent_runner,
        token: cfg.api.token.clone(),
        workspace_dir: cfg.agent.workspace_dir.clone(),
        stream_poll_interval: cfg.api.stream_poll_interval,
        stream_heartbeat_interval: cfg.api.stream_heartbeat_interval,
        started_at: Instant::now(),
    });
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.api.listen).await?;
    info!(listen = %cfg.api.listen, "API server listening");

    let mut serve_shutdown = shutdown_rx.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                serve_shutdown.changed().await.ok();
            })
            .await
    });

    tokio::select! {
        result = &mut server_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "server error"),
                Err(e) => error!(error = %e, "server task panicked"),
                Ok(Ok(())) => {}
            }
            shutdown_tx.send(true).ok();
        }
        _ = shutdown_signal() => {
            info!("received signal, shutting down");
            shutdown_tx.send(true).ok();
            // Let the server drain in-flight connections before exiting.
            match tokio::time::timeout(SHUTDOWN_CEILING, &mut server_task).await {
                Ok(Ok(Err(e))) => error!(error = %e, "server error during drain"),
                Ok(Err(e)) => error!(error = %e, "server task panicked"),
                Ok(Ok(Ok(()))) => {}
                Err(_) => {
                    warn!(ceiling = ?SHUTDOWN_CEILING, "server did not drain within ceiling");
                    server_task.abort();
                }
            }
        }
    }

    runner::await_worker(worker, SHUTDOWN_CEILING).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
