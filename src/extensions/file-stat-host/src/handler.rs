use async_trait::async_trait;
use exthost_ipc::{HandlerError, ProgressReporter, WorkHandler, WorkRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tokio::io::AsyncReadExt;

const READ_BLOCK: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: PathBuf,
}

/// Serves `stat` and `checksum` requests against the local filesystem.
#[derive(Debug, Default)]
pub struct FileStatHandler;

#[async_trait]
impl WorkHandler for FileStatHandler {
    async fn handle(
        &self,
        request: WorkRequest,
        progress: ProgressReporter,
    ) -> Result<Value, HandlerError> {
        match request.operation.as_str() {
            "stat" => stat(path_args(request.arguments)?).await,
            "checksum" => checksum(path_args(request.arguments)?, &progress).await,
            other => Err(HandlerError::UnknownOperation(other.to_string())),
        }
    }
}

fn path_args(arguments: Value) -> Result<PathArgs, HandlerError> {
    serde_json::from_value(arguments).map_err(|err| HandlerError::InvalidArguments(err.to_string()))
}

async fn stat(args: PathArgs) -> Result<Value, HandlerError> {
    let metadata = tokio::fs::metadata(&args.path)
        .await
        .map_err(|err| HandlerError::Failed(format!("{}: {err}", args.path.display())))?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_secs());

    Ok(json!({
        "path": args.path,
        "size": metadata.len(),
        "is_file": metadata.is_file(),
        "is_dir": metadata.is_dir(),
        "readonly": metadata.permissions().readonly(),
        "modified": modified,
    }))
}

async fn checksum(args: PathArgs, progress: &ProgressReporter) -> Result<Value, HandlerError> {
    let failed = |err: std::io::Error| HandlerError::Failed(format!("{}: {err}", args.path.display()));
    let mut file = tokio::fs::File::open(&args.path).await.map_err(failed)?;
    let total = file.metadata().await.map_err(failed)?.len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BLOCK];
    let mut read: u64 = 0;
    let mut reported = 0u8;
    loop {
        let n = file.read(&mut buf).await.map_err(failed)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read += n as u64;

        let percentage = if total == 0 {
            100
        } else {
            (read.min(total) * 100 / total) as u8
        };
        // One update per 10% step keeps the channel quiet on large files.
        if percentage / 10 > reported / 10 {
            reported = percentage;
            progress.report(percentage, Some(format!("{read} of {total} bytes")));
        }
    }
    tracing::debug!(path = %args.path.display(), bytes = read, "Checksum computed");

    Ok(json!({
        "path": args.path,
        "bytes": read,
        "sha256": hex::encode(hasher.finalize()),
    }))
}
