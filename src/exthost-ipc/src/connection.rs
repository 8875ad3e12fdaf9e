//! One bidirectional channel to an extension host process.
//!
//! A [`Connection`] serializes calls: at most one request is on the wire at a time
//! and a second caller waits for the first to finish. Responses are correlated by
//! that discipline alone; envelopes carry no call id.

use exthost_core::IpcConfig;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::chunked::{ChunkedTransport, TransportLimits};
use crate::connector::{Connector, ConnectorError, ServiceTarget};
use crate::envelope::{Envelope, EnvelopeKind, Progress, RemoteError, WorkRequest, WorkResult};
use crate::frame::TransportError;

/// Receives progress envelopes while a call is outstanding.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Opening,
    Open,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub limits: TransportLimits,
    /// Measured from the moment the request starts going out.
    pub call_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&IpcConfig::default())
    }
}

impl From<&IpcConfig> for ConnectionOptions {
    fn from(config: &IpcConfig) -> Self {
        Self {
            limits: TransportLimits::from(config),
            call_timeout: config.call_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to open connection to {endpoint}: {source}")]
    Open {
        endpoint: String,
        source: ConnectorError,
    },
    #[error("connection is not open")]
    NotOpen,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection closed while awaiting a response")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("unexpected {0} envelope in response")]
    UnexpectedResponse(EnvelopeKind),
    #[error("extension reported an error: {0}")]
    Remote(RemoteError),
}

struct Session {
    transport: ChunkedTransport,
    process: Option<Child>,
    /// Terminal envelopes still owed for calls abandoned by timeout.
    stale_results: usize,
}

impl Session {
    async fn exchange(
        &mut self,
        request: WorkRequest,
        progress: Option<&ProgressCallback>,
    ) -> Result<WorkResult, ConnectionError> {
        self.transport.send(&Envelope::WorkRequest(request)).await?;
        loop {
            let envelope = self
                .transport
                .receive()
                .await?
                .ok_or(TransportError::Closed)?;

            if self.stale_results > 0 {
                if envelope.kind().is_terminal() {
                    self.stale_results -= 1;
                    tracing::debug!(
                        remaining = self.stale_results,
                        "Discarded late response of an abandoned call"
                    );
                }
                continue;
            }

            match envelope {
                Envelope::Progress(update) => {
                    if let Some(callback) = progress {
                        callback(&update);
                    }
                }
                Envelope::WorkResult(result) => return Ok(result),
                Envelope::Error(err) => return Err(ConnectionError::Remote(err)),
                other => return Err(ConnectionError::UnexpectedResponse(other.kind())),
            }
        }
    }

    async fn shutdown(mut self) {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.transport.send(&Envelope::Shutdown)).await;
        if let Err(err) = self.transport.close().await {
            tracing::debug!(error = %err, "Error while closing channel");
        }
        if let Some(mut child) = self.process.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "Extension host process exited"),
                _ => {
                    if let Err(err) = child.kill().await {
                        tracing::warn!(error = %err, "Failed to kill extension host process");
                    }
                }
            }
        }
    }
}

/// Connection to one extension service.
pub struct Connection {
    target: ServiceTarget,
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    status: Mutex<ConnectionStatus>,
    /// Held for the whole of `open`, `call` and `close`; this is the single-flight lock.
    session: AsyncMutex<Option<Session>>,
    /// Bumped on every `close` so an in-flight call can abort.
    close_generation: watch::Sender<u64>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.target.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    pub fn new(
        target: ServiceTarget,
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
    ) -> Self {
        let (close_generation, _) = watch::channel(0);
        Self {
            target,
            connector,
            options,
            status: Mutex::new(ConnectionStatus::Closed),
            session: AsyncMutex::new(None),
            close_generation,
        }
    }

    pub fn target(&self) -> &ServiceTarget {
        &self.target
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    /// Establishes the channel. Does nothing if it is already open.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        self.set_status(ConnectionStatus::Opening);
        match self.connector.connect(&self.target).await {
            Ok(connected) => {
                *session = Some(Session {
                    transport: ChunkedTransport::new(connected.channel, self.options.limits),
                    process: connected.process,
                    stale_results: 0,
                });
                self.set_status(ConnectionStatus::Open);
                tracing::info!(endpoint = %self.target.endpoint, "Connection opened");
                Ok(())
            }
            Err(source) => {
                self.set_status(ConnectionStatus::Failed);
                tracing::warn!(
                    endpoint = %self.target.endpoint,
                    error = %source,
                    "Failed to open connection"
                );
                Err(ConnectionError::Open {
                    endpoint: self.target.endpoint.to_string(),
                    source,
                })
            }
        }
    }

    /// Sends `request` and waits for its result, forwarding progress to `progress`.
    ///
    /// A timeout leaves the connection open; transport and protocol failures tear
    /// it down so the next `open` starts from a clean channel.
    pub async fn call(
        &self,
        request: WorkRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<WorkResult, ConnectionError> {
        let mut closed = self.close_generation.subscribe();
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ConnectionError::NotOpen)?;

        let operation = request.operation.clone();
        let deadline = Instant::now() + self.options.call_timeout;
        let outcome = tokio::select! {
            biased;
            _ = closed.changed() => Err(ConnectionError::Closed),
            result = tokio::time::timeout_at(deadline, session.exchange(request, progress.as_ref())) => {
                result.unwrap_or(Err(ConnectionError::Timeout(self.options.call_timeout)))
            }
        };

        match &outcome {
            Ok(_) | Err(ConnectionError::Remote(_)) | Err(ConnectionError::Closed) => {}
            Err(ConnectionError::Timeout(after)) => {
                if session.transport.is_desynchronized() {
                    tracing::warn!(
                        endpoint = %self.target.endpoint,
                        operation = %operation,
                        "Call timed out mid-send, dropping the channel"
                    );
                    self.teardown(&mut guard, ConnectionStatus::Failed).await;
                } else {
                    session.stale_results += 1;
                    tracing::warn!(
                        endpoint = %self.target.endpoint,
                        operation = %operation,
                        timeout = ?after,
                        "Call timed out, connection stays open"
                    );
                }
            }
            Err(ConnectionError::Transport(TransportError::Closed)) => {
                tracing::info!(endpoint = %self.target.endpoint, "Peer closed the connection");
                self.teardown(&mut guard, ConnectionStatus::Closed).await;
            }
            Err(err) => {
                tracing::warn!(
                    endpoint = %self.target.endpoint,
                    operation = %operation,
                    error = %err,
                    "Call failed, dropping the channel"
                );
                self.teardown(&mut guard, ConnectionStatus::Failed).await;
            }
        }
        outcome
    }

    /// Releases the channel. A call awaiting a response fails with [`ConnectionError::Closed`].
    pub async fn close(&self) {
        self.close_generation.send_modify(|generation| *generation += 1);
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            tracing::info!(endpoint = %self.target.endpoint, "Closing connection");
        }
        self.teardown(&mut guard, ConnectionStatus::Closed).await;
    }

    async fn teardown(&self, slot: &mut Option<Session>, status: ConnectionStatus) {
        if let Some(session) = slot.take() {
            session.shutdown().await;
        }
        self.set_status(status);
    }
}
