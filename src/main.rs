use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::ratelimit::LimitResolver;
use floodgate::server::HttpServer;

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Distributed API admission control")]
struct Cli {
    /// Configuration file (YAML); FLOODGATE_* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the configured endpoints (default)
    Serve,
    /// Print the effective limit for every endpoint, method and category
    Limits,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        endpoints = config.endpoints.len(),
        "Configuration loaded"
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await?,
        Command::Limits => print_limits(&config),
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
    }
}

async fn serve(config: FloodgateConfig) -> anyhow::Result<()> {
    let admission = Arc::new(config.admission()?);
    let server = HttpServer::new(config.server.http_addr, admission, config.endpoints);

    info!("Starting HTTP server on {}", config.server.http_addr);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate stopped");
    Ok(())
}

fn print_limits(config: &FloodgateConfig) {
    let resolver = LimitResolver::new(config.limits.clone());
    println!("{:<24} {:<8} {:<6} LIMIT", "ENDPOINT", "METHOD", "CAT");
    for endpoint in &config.endpoints {
        if !endpoint.rate_limited {
            println!("{:<24} {:<8} {:<6} unlimited", endpoint.name, "*", "*");
            continue;
        }
        let policy = endpoint.policy();
        for (method, category, limit) in resolver.resolve_all(&policy.config) {
            println!(
                "{:<24} {:<8} {:<6} {}",
                endpoint.name,
                method.as_str(),
                category.as_str(),
                limit
            );
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
