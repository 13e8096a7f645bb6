//! asaasd: local-first sync daemon for one asaas workspace
//!
//! Usage:
//!   asaasd [--config asaas.toml] [--log info] [--log-format text|json]
//!
//! Runs record sync, asset replication and exchange-rate monitoring until
//! interrupted.

mod context;
mod daemon;
mod metrics;

use anyhow::Result;
use asaas_core::config::AsaasConfig;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "asaasd", version, about = "asaas local-first sync daemon")]
struct Cli {
    /// Path to the asaas.toml configuration file
    #[arg(long, short = 'c', env = "ASAAS_CONFIG", default_value = "asaas.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "ASAAS_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "ASAAS_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: its [daemon] section supplies logging defaults
    let (config, loaded) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "asaasd starting"
    );
    if !loaded {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    daemon::run(config).await
}

/// Parse the TOML config. A missing file yields defaults and `false`.
async fn load_config(path: &Path) -> Result<(AsaasConfig, bool)> {
    if !path.exists() {
        return Ok((AsaasConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    let config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
