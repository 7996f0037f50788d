use clap::Parser;
use lbpool::api::{start_api_server, ApiState};
use lbpool::balance::MetricsSink;
use lbpool::config::{Config, LoggingConfig};
use lbpool::{BackendGroup, LbPoolError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(not(feature = "metrics"))]
use lbpool::balance::NoopMetrics;
#[cfg(feature = "metrics")]
use lbpool::balance::PrometheusMetrics;

#[cfg(feature = "fast-allocator")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "lbpool")]
#[command(about = "Load-balancing backend connection pool monitor", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long)]
    log_level: Option<String>,

    /// Monitoring API port (overrides config)
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!("Edit the file and run: lbpool --config {:?}", config_path);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => Config::default(),
    };

    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(port) = args.api_port {
        config.api.bind_port = port;
    }

    init_logging(&config.logging)?;

    info!("lbpool v{} starting", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from: {:?}", path),
        None => info!("No configuration file specified, using defaults"),
    }
    if config.backends.is_empty() {
        warn!("No backends configured");
    }

    #[cfg(feature = "metrics")]
    let prometheus = Arc::new(PrometheusMetrics::new()?);
    #[cfg(feature = "metrics")]
    let sink: Arc<dyn MetricsSink> = prometheus.clone();
    #[cfg(not(feature = "metrics"))]
    let sink: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);

    let group = Arc::new(BackendGroup::from_config(&config, sink)?);
    info!("{} backend pool(s) initialized", group.len());

    let shutdown = CancellationToken::new();
    let heartbeat = group.spawn_heartbeat(config.heartbeat.interval(), shutdown.clone());

    let api = if config.api.enabled {
        let state = ApiState::new(Arc::clone(&group));
        #[cfg(feature = "metrics")]
        let state = state.with_metrics(prometheus.clone());
        Some(start_api_server(&config.api, state).await?)
    } else {
        None
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    shutdown.cancel();
    if let Err(e) = heartbeat.await {
        error!("Heartbeat task failed: {}", e);
    }
    if let Some(api) = api {
        api.abort();
    }
    group.close_all();

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&logging.level)
        .map_err(|e| LbPoolError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}
