use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon_relay::config;
use beacon_relay::state::AppState;
use beacon_relay::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Beacon Relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "beacon-relay")]
#[command(version, about = "WebRTC signaling relay for one-to-many live broadcasts", long_about = None)]
struct CliArgs {
    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    http_port: Option<u16>,

    /// JSON configuration file (defaults are used when omitted)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Initialize logging with CLI arguments
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting Beacon Relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(args.config.as_deref()).await?;
    if let Some(path) = &args.config {
        tracing::info!("Configuration file: {}", path.display());
    }

    // Apply CLI argument overrides to config (only if explicitly specified)
    if let Some(addr) = args.address {
        config.web.bind_address = addr;
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }

    let bind_ip: IpAddr = config
        .web
        .bind_address
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.web.bind_address, e))?;
    let addr = SocketAddr::new(bind_ip, config.web.http_port);

    tracing::info!(
        "Signaling endpoint: ws://{}{} (outbox capacity {}, anonymous subscribers {})",
        addr,
        config.web.ws_path,
        config.signaling.outbox_capacity,
        if config.signaling.allow_anonymous_subscribers {
            "allowed"
        } else {
            "rejected"
        }
    );

    let state = AppState::new(config);
    let app = web::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    // Setup graceful shutdown
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown_signal => {}
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    let status = state.hub.status();
    tracing::info!(
        "Server shutdown complete ({} live broadcasts, {} viewers dropped)",
        status.broadcasts.active_count,
        status.connections.viewers
    );
    Ok(())
}

/// Initialize logging with the given level and verbosity
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    // Build filter string based on effective level
    let filter = match effective_level {
        LogLevel::Error => "beacon_relay=error,tower_http=error",
        LogLevel::Warn => "beacon_relay=warn,tower_http=warn",
        LogLevel::Info => "beacon_relay=info,tower_http=info",
        LogLevel::Verbose => "beacon_relay=debug,tower_http=info",
        LogLevel::Debug => "beacon_relay=debug,tower_http=debug",
        LogLevel::Trace => "beacon_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
