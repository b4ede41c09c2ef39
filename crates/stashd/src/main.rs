//! stashd: stash server daemon
//!
//! Usage:
//!   stashd [--config /etc/stash/config.toml] [--listen 127.0.0.1:3200]
//!
//! Serves the Vault gRPC surface backed by the in-memory stores; the files
//! root from the config holds attachment bytes.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use stash_server::{serve, Authenticator, FileService, RecordService, VaultService};

#[derive(Parser, Debug)]
#[command(name = "stashd", version, about = "stash secret-store daemon")]
struct Cli {
    /// Path to stash.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "STASH_CONFIG",
        default_value = "/etc/stash/config.toml"
    )]
    config: PathBuf,

    /// Listen address override (default from config)
    #[arg(long, env = "STASH_LISTEN")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STASH_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "STASH_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "stashd starting"
    );

    let config = load_config(&cli.config).await?;
    let listen = cli.listen.unwrap_or(config.server.listen.clone());
    let addr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("bad listen address {listen}: {e}"))?;

    tokio::fs::create_dir_all(&config.files.root).await?;

    let transfer = stash_crypto::TransferCipher::from_files(
        None,
        config.crypto.transfer_identity.as_deref(),
    )?;
    if transfer.can_decrypt() {
        info!("in-transit layer enabled for uploads");
    }

    let file_store = Arc::new(stash_server::memory::MemoryFileStore::new());
    let record_store = Arc::new(stash_server::memory::MemoryRecordStore::new());
    let files = FileService::new(file_store);
    let records = RecordService::new(record_store, files.clone());
    let service = VaultService::new(
        Arc::new(Authenticator::new()),
        records,
        files,
        config.files.root.clone(),
    )
    .with_transfer(transfer);

    serve(addr, service).await
}

async fn load_config(path: &PathBuf) -> Result<stash_core::config::StashConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(stash_core::config::StashConfig::default())
    }
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
