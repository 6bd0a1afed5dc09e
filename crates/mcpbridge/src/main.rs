//! `mcpbridge` CLI entry point.
//!
//! Loads configuration, starts the Supervisor's children, the Health
//! Checker, and the stale-session sweeper, then serves the HTTP surface
//! until it receives a shutdown signal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use mcpbridge_core::{BridgeConfig, HealthChecker, StaleSweeper, Supervisor};
use mcpbridge_http::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ENV_CONFIG_PATH: &str = "MCP_BRIDGE_CONFIG";

#[derive(Parser, Debug)]
#[command(name = "mcpbridge", version, about = "Remote-MCP to local-stdio-MCP bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log output format.
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load configuration, spawn the configured children, and serve the
    /// HTTP surface.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long, env = ENV_CONFIG_PATH)]
        config: PathBuf,

        /// Override the configured bind port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the configured domain.
        #[arg(long)]
        domain: Option<String>,
    },
    /// Load and validate configuration without binding a port or
    /// spawning any child; exits 0 if valid, non-zero otherwise.
    Check {
        #[arg(long, env = ENV_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<BridgeConfig> {
    mcpbridge_core::config::load(path, |k| std::env::var(k).ok())
        .map_err(|e| anyhow::anyhow!("{e}"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let exit_code = match cli.command {
        Command::Check { config } => run_check(&config),
        Command::Serve { config, port, domain } => run_serve(&config, port, domain).await,
    };
    std::process::exit(exit_code);
}

fn run_check(config_path: &std::path::Path) -> i32 {
    match load_config(config_path) {
        Ok(cfg) => {
            info!(
                "configuration OK: {} server(s) configured for {}.{}",
                cfg.servers.len(),
                cfg.subdomain_prefix,
                cfg.domain
            );
            0
        }
        Err(e) => {
            error!("configuration invalid: {e}");
            1
        }
    }
}

async fn run_serve(config_path: &std::path::Path, port: Option<u16>, domain: Option<String>) -> i32 {
    let mut config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration invalid: {e}");
            return 1;
        }
    };
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(domain) = domain {
        config.domain = domain;
    }
    let config = Arc::new(config);

    let supervisor = Arc::new(Supervisor::new(
        mcpbridge_core::serializer::DEFAULT_QUEUE_DEPTH,
        config.session_root.clone(),
    ));

    let global_servers: HashMap<String, mcpbridge_core::ServerConfig> = config
        .servers
        .iter()
        .filter(|(_, s)| !s.session_scoped)
        .map(|(name, s)| (name.clone(), s.clone()))
        .collect();

    for (name, server_config) in &global_servers {
        if let Err(e) = supervisor.start(name, server_config.clone()).await {
            error!("failed to start child '{name}': {e}");
            return 1;
        }
    }

    let health = Arc::new(HealthChecker::new(supervisor.clone(), global_servers));
    let state = AppState::new(config.clone(), supervisor.clone(), health.clone());

    let shutdown = CancellationToken::new();

    let health_task = {
        let health = health.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { health.run(shutdown).await })
    };

    let sweeper = Arc::new(StaleSweeper::new(
        state.sessions.clone(),
        state.connections.clone(),
        supervisor.clone(),
        config.operation_timeout,
    ));
    let sweeper_task = {
        let sweeper = sweeper.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    let router = mcpbridge_http::build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            return 1;
        }
    };

    info!("mcpbridge listening on {addr} ({}.{})", config.subdomain_prefix, config.domain);

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    let _ = health_task.await;
    let _ = sweeper_task.await;

    match serve_result {
        Ok(()) => 0,
        Err(e) => {
            error!("HTTP server error: {e}");
            1
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
