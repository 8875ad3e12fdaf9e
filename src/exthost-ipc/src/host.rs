//! Runtime for the extension side of a connection.
//!
//! A host process binds its endpoint, accepts exactly one connection and serves
//! work requests on it until the peer disconnects or sends `Shutdown`.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::chunked::{ChunkedTransport, TransportLimits};
use crate::envelope::{
    Envelope, Progress, ProtocolError, RemoteError, RemoteErrorKind, WorkRequest, WorkResult,
};
use crate::frame::{FrameChannel, TransportError};

/// Business logic of an extension.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(
        &self,
        request: WorkRequest,
        progress: ProgressReporter,
    ) -> Result<Value, HandlerError>;
}

/// Streams progress envelopes for the request being handled.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<Progress>,
}

impl ProgressReporter {
    pub fn report(&self, percentage: u8, message: impl Into<Option<String>>) {
        let update = Progress {
            percentage: percentage.min(100),
            message: message.into(),
        };
        // The receiver only goes away once the request has completed.
        let _ = self.tx.send(update);
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unknown operation {0:?}")]
    UnknownOperation(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
}

impl From<HandlerError> for RemoteError {
    fn from(err: HandlerError) -> Self {
        let kind = match err {
            HandlerError::UnknownOperation(_) => RemoteErrorKind::UnknownOperation,
            HandlerError::InvalidArguments(_) => RemoteErrorKind::InvalidArguments,
            HandlerError::Failed(_) => RemoteErrorKind::Internal,
        };
        RemoteError {
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to bind endpoint {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("failed to accept a connection on {address}: {source}")]
    Accept {
        address: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a serving loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The peer sent `Shutdown`.
    Shutdown,
    /// The peer closed the channel.
    Disconnected,
}

/// Serves work requests on `channel` until shutdown or disconnect.
pub async fn serve_channel(
    channel: Box<dyn FrameChannel>,
    handler: Arc<dyn WorkHandler>,
    limits: TransportLimits,
) -> Result<ServeExit, HostError> {
    let mut transport = ChunkedTransport::new(channel, limits);
    let exit = loop {
        let envelope = match transport.receive().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break ServeExit::Disconnected,
            Err(TransportError::Protocol(err)) => {
                tracing::warn!(error = %err, "Rejecting undecodable message");
                transport.send(&Envelope::Error(reject(err))).await?;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        match envelope {
            Envelope::WorkRequest(request) => dispatch(&mut transport, handler.as_ref(), request).await?,
            Envelope::Shutdown => break ServeExit::Shutdown,
            other => {
                tracing::warn!(kind = %other.kind(), "Unexpected message from host application");
                transport
                    .send(&Envelope::Error(RemoteError {
                        kind: RemoteErrorKind::UnexpectedMessage,
                        message: format!("{} is not a request", other.kind()),
                    }))
                    .await?;
            }
        }
    };

    tracing::info!(?exit, "Connection finished");
    if let Err(err) = transport.close().await {
        tracing::debug!(error = %err, "Error while closing channel");
    }
    Ok(exit)
}

fn reject(err: ProtocolError) -> RemoteError {
    let kind = match err {
        ProtocolError::Unrecognized { .. } => RemoteErrorKind::UnrecognizedMessage,
        _ => RemoteErrorKind::InvalidArguments,
    };
    RemoteError {
        kind,
        message: err.to_string(),
    }
}

async fn dispatch(
    transport: &mut ChunkedTransport,
    handler: &dyn WorkHandler,
    request: WorkRequest,
) -> Result<(), TransportError> {
    let operation = request.operation.clone();
    tracing::debug!(operation = %operation, "Handling work request");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let work = handler.handle(request, ProgressReporter { tx });
    tokio::pin!(work);

    let outcome = loop {
        tokio::select! {
            outcome = &mut work => break outcome,
            Some(update) = rx.recv() => transport.send(&Envelope::Progress(update)).await?,
        }
    };
    while let Ok(update) = rx.try_recv() {
        transport.send(&Envelope::Progress(update)).await?;
    }

    let reply = match outcome {
        Ok(value) => Envelope::WorkResult(WorkResult::new(value)),
        Err(err) => {
            tracing::warn!(operation = %operation, error = %err, "Work request failed");
            Envelope::Error(err.into())
        }
    };
    transport.send(&reply).await
}

/// Binds `address`, accepts one connection and serves it.
#[cfg(unix)]
pub async fn serve_endpoint(
    address: &str,
    handler: Arc<dyn WorkHandler>,
    limits: TransportLimits,
) -> Result<ServeExit, HostError> {
    use crate::frame::StreamChannel;
    use std::path::Path;

    let path = Path::new(address);
    if path.exists() {
        // Left behind by a host that did not exit cleanly.
        let _ = std::fs::remove_file(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| HostError::Bind {
            address: address.to_string(),
            source,
        })?;
    }

    let listener = tokio::net::UnixListener::bind(path).map_err(|source| HostError::Bind {
        address: address.to_string(),
        source,
    })?;
    tracing::info!(address, "Waiting for the host application to connect");
    let accepted = listener.accept().await;
    drop(listener);
    let _ = std::fs::remove_file(path);

    let (stream, _) = accepted.map_err(|source| HostError::Accept {
        address: address.to_string(),
        source,
    })?;
    serve_channel(
        Box::new(StreamChannel::new(stream, limits.buffer_size)),
        handler,
        limits,
    )
    .await
}

/// Creates the named pipe `address`, waits for one client and serves it.
#[cfg(windows)]
pub async fn serve_endpoint(
    address: &str,
    handler: Arc<dyn WorkHandler>,
    limits: TransportLimits,
) -> Result<ServeExit, HostError> {
    use crate::frame::StreamChannel;
    use tokio::net::windows::named_pipe::ServerOptions;

    let server = ServerOptions::new()
        .first_pipe_instance(true)
        .create(address)
        .map_err(|source| HostError::Bind {
            address: address.to_string(),
            source,
        })?;
    tracing::info!(address, "Waiting for the host application to connect");
    server.connect().await.map_err(|source| HostError::Accept {
        address: address.to_string(),
        source,
    })?;
    serve_channel(
        Box::new(StreamChannel::new(server, limits.buffer_size)),
        handler,
        limits,
    )
    .await
}

#[cfg(not(any(unix, windows)))]
pub async fn serve_endpoint(
    address: &str,
    _handler: Arc<dyn WorkHandler>,
    _limits: TransportLimits,
) -> Result<ServeExit, HostError> {
    Err(HostError::Bind {
        address: address.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "local sockets are not available on this platform",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::split_into_chunks;
    use crate::frame::memory_pair;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl WorkHandler for Doubler {
        async fn handle(
            &self,
            request: WorkRequest,
            progress: ProgressReporter,
        ) -> Result<Value, HandlerError> {
            match request.operation.as_str() {
                "double" => {
                    let n = request
                        .arguments
                        .get("n")
                        .and_then(Value::as_f64)
                        .ok_or_else(|| HandlerError::InvalidArguments("n".into()))?;
                    progress.report(50, Some("halfway".to_string()));
                    Ok(json!(n * 2.0))
                }
                other => Err(HandlerError::UnknownOperation(other.to_string())),
            }
        }
    }

    fn limits() -> TransportLimits {
        TransportLimits {
            buffer_size: 64,
            max_message_bytes: 1 << 20,
        }
    }

    #[tokio::test]
    async fn serves_requests_until_shutdown() {
        let (client, server) = memory_pair(64, 32);
        let serving = tokio::spawn(serve_channel(Box::new(server), Arc::new(Doubler), limits()));
        let mut client = ChunkedTransport::new(Box::new(client), limits());

        client
            .send(&Envelope::WorkRequest(WorkRequest::new("double", json!({"n": 21}))))
            .await
            .unwrap();
        assert_eq!(
            client.receive().await.unwrap(),
            Some(Envelope::Progress(Progress {
                percentage: 50,
                message: Some("halfway".into())
            }))
        );
        assert_eq!(
            client.receive().await.unwrap(),
            Some(Envelope::WorkResult(WorkResult::new(json!(42.0))))
        );

        client
            .send(&Envelope::WorkRequest(WorkRequest::new("triple", json!(null))))
            .await
            .unwrap();
        match client.receive().await.unwrap() {
            Some(Envelope::Error(err)) => assert_eq!(err.kind, RemoteErrorKind::UnknownOperation),
            other => panic!("expected error, got {other:?}"),
        }

        client.send(&Envelope::Shutdown).await.unwrap();
        assert_eq!(serving.await.unwrap().unwrap(), ServeExit::Shutdown);
    }

    #[tokio::test]
    async fn unrecognized_message_gets_error_reply() {
        let (mut raw, server) = memory_pair(64, 32);
        let serving = tokio::spawn(serve_channel(Box::new(server), Arc::new(Doubler), limits()));

        for chunk in split_into_chunks(br#"{"type":"Telemetry","payload":{}}"#, 64) {
            raw.send_frame(chunk).await.unwrap();
        }
        let mut client = ChunkedTransport::new(Box::new(raw), limits());
        match client.receive().await.unwrap() {
            Some(Envelope::Error(err)) => {
                assert_eq!(err.kind, RemoteErrorKind::UnrecognizedMessage)
            }
            other => panic!("expected error, got {other:?}"),
        }

        client.close().await.unwrap();
        assert_eq!(serving.await.unwrap().unwrap(), ServeExit::Disconnected);
    }

    #[tokio::test]
    async fn large_request_is_reassembled_before_dispatch() {
        struct Measure;

        #[async_trait]
        impl WorkHandler for Measure {
            async fn handle(
                &self,
                request: WorkRequest,
                _progress: ProgressReporter,
            ) -> Result<Value, HandlerError> {
                let blob = request.arguments["blob"].as_str().unwrap_or_default();
                Ok(json!(blob.len()))
            }
        }

        let limits = TransportLimits {
            buffer_size: 2048,
            max_message_bytes: 1 << 20,
        };
        let (client, server) = memory_pair(2048, 32);
        let serving = tokio::spawn(serve_channel(Box::new(server), Arc::new(Measure), limits));
        let mut client = ChunkedTransport::new(Box::new(client), limits);

        let blob = "z".repeat(10_000);
        client
            .send(&Envelope::WorkRequest(WorkRequest::new("measure", json!({ "blob": blob }))))
            .await
            .unwrap();
        assert_eq!(
            client.receive().await.unwrap(),
            Some(Envelope::WorkResult(WorkResult::new(json!(10_000))))
        );

        client.close().await.unwrap();
        assert_eq!(serving.await.unwrap().unwrap(), ServeExit::Disconnected);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn serve_endpoint_accepts_one_socket_client() {
        use crate::frame::StreamChannel;

        let tmp = tempfile::tempdir().unwrap();
        let address = tmp.path().join("svc.sock").to_string_lossy().into_owned();
        let serving = {
            let address = address.clone();
            tokio::spawn(async move { serve_endpoint(&address, Arc::new(Doubler), limits()).await })
        };

        let stream = loop {
            match tokio::net::UnixStream::connect(&address).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        let mut client = ChunkedTransport::new(Box::new(StreamChannel::new(stream, 64)), limits());
        client
            .send(&Envelope::WorkRequest(WorkRequest::new("double", json!({"n": 1.5}))))
            .await
            .unwrap();
        assert!(matches!(client.receive().await.unwrap(), Some(Envelope::Progress(_))));
        assert_eq!(
            client.receive().await.unwrap(),
            Some(Envelope::WorkResult(WorkResult::new(json!(3.0))))
        );
        client.send(&Envelope::Shutdown).await.unwrap();

        assert_eq!(serving.await.unwrap().unwrap(), ServeExit::Shutdown);
        assert!(!std::path::Path::new(&address).exists());
    }
}
