mod handler;

use anyhow::{bail, Context, Result};
use clap::Parser;
use exthost_core::{init_stderr_logging, LogLevel, MAX_BUFFER_SIZE};
use exthost_ipc::{serve_endpoint, TransportLimits, ENDPOINT_ENV};
use handler::FileStatHandler;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "file-stat-host", version, about = "Serves file statistics to the extension host")]
struct Cli {
    /// Address to listen on (falls back to EXTHOST_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,
    /// Maximum data bytes per chunk
    #[arg(long)]
    buffer_size: Option<usize>,
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_stderr_logging(if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    })?;

    let endpoint = cli
        .endpoint
        .or_else(|| std::env::var(ENDPOINT_ENV).ok())
        .with_context(|| format!("no endpoint given (use --endpoint or {ENDPOINT_ENV})"))?;

    let mut limits = TransportLimits::default();
    if let Some(buffer_size) = cli.buffer_size {
        if buffer_size == 0 || buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer size must be between 1 and {MAX_BUFFER_SIZE}");
        }
        limits.buffer_size = buffer_size;
    }

    let exit = serve_endpoint(&endpoint, Arc::new(FileStatHandler), limits).await?;
    tracing::info!(?exit, "File statistics host exiting");
    Ok(())
}
