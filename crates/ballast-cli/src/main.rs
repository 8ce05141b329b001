//! ballast - NBD server backed by S3-compatible object storage

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ballast_block::{NbdServer, ServerConfig};
use ballast_store::{ObjectClient, S3Config};

/// Configuration was invalid
const EXIT_CONFIG: u8 = 1;
/// The listen socket could not be bound
const EXIT_LISTEN: u8 = 2;
/// The object store was unreachable at startup
const EXIT_STORAGE: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "ballast",
    version,
    about = "NBD server backed by S3-compatible object storage"
)]
struct Cli {
    /// Bind host
    #[arg(long, env = "BALLAST_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, env = "BALLAST_PORT", default_value_t = 10809)]
    port: u16,

    /// Export size (e.g. 512MB, 1GB, 2TB)
    #[arg(long, env = "BALLAST_SIZE", default_value = "1GB")]
    size: String,

    /// Persistence block size in bytes; only 131072 is supported
    #[arg(long, env = "BALLAST_BLOCK_SIZE", default_value_t = 131072)]
    block_size: u64,

    /// S3 endpoint URL
    #[arg(long, env = "BALLAST_S3_ENDPOINT", default_value = "http://localhost:9000")]
    s3_endpoint: String,

    /// S3 access key
    #[arg(long, env = "BALLAST_S3_ACCESS_KEY", default_value = "minioadmin")]
    s3_access_key: String,

    /// S3 secret key
    #[arg(long, env = "BALLAST_S3_SECRET_KEY", default_value = "minioadmin")]
    s3_secret_key: String,

    /// S3 bucket
    #[arg(long, env = "BALLAST_S3_BUCKET", default_value = "ballast")]
    s3_bucket: String,

    /// S3 region
    #[arg(long, env = "BALLAST_S3_REGION", default_value = "us-east-1")]
    s3_region: String,

    /// Lease lifetime in seconds
    #[arg(long, env = "BALLAST_LEASE_TTL", default_value_t = 30)]
    lease_ttl: u64,

    /// Lease renewal interval in seconds
    #[arg(long, env = "BALLAST_HEARTBEAT_INTERVAL", default_value_t = 15)]
    heartbeat_interval: u64,

    /// Maximum concurrent block uploads per flush
    #[arg(long, env = "BALLAST_FLUSH_PARALLELISM", default_value_t = 10)]
    flush_parallelism: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BALLAST_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!("starting ballast NBD server");
    info!("    bind:              {}", config.bind_addr());
    info!("    export size:       {} bytes ({})", config.export_size, cli.size);
    info!("    block size:        {} bytes", config.block_size);
    info!("    s3 endpoint:       {}", config.s3.endpoint);
    info!("    s3 bucket:         {}", config.s3.bucket);
    info!("    s3 region:         {}", config.s3.region);
    info!("    lease ttl:         {}s", config.lease_ttl_secs);
    info!("    heartbeat:         {}s", config.heartbeat_interval_secs);
    info!("    flush parallelism: {}", config.flush_parallelism);

    let client = match ObjectClient::for_s3(&config.s3) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("failed to construct object client: {e}");
            return ExitCode::from(EXIT_STORAGE);
        }
    };
    if let Err(e) = client.probe().await {
        error!("object store unreachable: {e}");
        return ExitCode::from(EXIT_STORAGE);
    }

    let server = match NbdServer::bind(config, client).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind listener: {e}");
            return ExitCode::from(EXIT_LISTEN);
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, shutting down");
            shutdown.signal();
        }
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server failed: {e}");
            ExitCode::from(EXIT_LISTEN)
        }
    }
}

fn build_config(cli: &Cli) -> Result<ServerConfig> {
    let export_size = parse_size(&cli.size).context("invalid --size")?;

    let mut config = ServerConfig::new()
        .bind(cli.host.clone(), cli.port)
        .export_size(export_size)
        .s3(S3Config {
            endpoint: cli.s3_endpoint.clone(),
            access_key: cli.s3_access_key.clone(),
            secret_key: cli.s3_secret_key.clone(),
            bucket: cli.s3_bucket.clone(),
            region: cli.s3_region.clone(),
        })
        .lease(cli.lease_ttl, cli.heartbeat_interval)
        .flush_parallelism(cli.flush_parallelism);
    config.block_size = cli.block_size;

    config.validate()?;
    Ok(config)
}

/// Parse size string (e.g. "1G", "512MB", "131072") to bytes
fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim().to_uppercase();

    // Plain numbers are bytes
    if let Ok(num) = size.parse::<u64>() {
        return Ok(num);
    }

    let split_pos = size
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("invalid size format"))?;

    let (num_str, suffix) = size.split_at(split_pos);
    let num: u64 = num_str.parse().context("invalid numeric value in size")?;

    let multiplier = match suffix {
        "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024u64 * 1024 * 1024 * 1024,
        _ => anyhow::bail!(
            "invalid size suffix '{}'. Use B, K/KB, M/MB, G/GB, or T/TB",
            suffix
        ),
    };

    Ok(num * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("131072").unwrap(), 131072);
        assert_eq!(parse_size("512MB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("2TB").unwrap(), 2u64 * 1024 * 1024 * 1024 * 1024);
        assert!(parse_size("10X").is_err());
        assert!(parse_size("garbage").is_err());
    }

    #[test]
    fn test_cli_defaults_build_valid_config() {
        let cli = Cli::parse_from(["ballast"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.port, 10809);
        assert_eq!(config.export_size, 1024 * 1024 * 1024);
        assert_eq!(config.block_size, 131072);
    }

    #[test]
    fn test_cli_rejects_bad_block_size() {
        let cli = Cli::parse_from(["ballast", "--block-size", "4096"]);
        assert!(build_config(&cli).is_err());
    }
}
