use exthost_ipc::{ConnectionError, RemoteError, TransportError};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Why an invocation produced no result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvokeFailure {
    #[error("extension is not loaded")]
    NotLoaded,
    #[error("extension declares no service")]
    NoService,
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before a response arrived")]
    Closed,
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("extension reported an error: {0}")]
    Remote(RemoteError),
}

impl From<ConnectionError> for InvokeFailure {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Open { .. } => InvokeFailure::Open(err.to_string()),
            ConnectionError::NotOpen | ConnectionError::Closed => InvokeFailure::Closed,
            ConnectionError::Timeout(after) => InvokeFailure::Timeout(after),
            ConnectionError::Transport(TransportError::Protocol(err)) => {
                InvokeFailure::MalformedResponse(err.to_string())
            }
            ConnectionError::Transport(err) => InvokeFailure::Transport(err.to_string()),
            ConnectionError::UnexpectedResponse(kind) => {
                InvokeFailure::MalformedResponse(format!("unexpected {kind} envelope"))
            }
            ConnectionError::Remote(err) => InvokeFailure::Remote(err),
        }
    }
}

/// Result of [`Extension::invoke`](crate::Extension::invoke); failures are values, never panics.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Completed(Value),
    Failed(InvokeFailure),
}

impl InvokeOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, InvokeOutcome::Completed(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            InvokeOutcome::Completed(value) => Some(value),
            InvokeOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&InvokeFailure> {
        match self {
            InvokeOutcome::Completed(_) => None,
            InvokeOutcome::Failed(failure) => Some(failure),
        }
    }

    /// Numeric result, or NaN when the call failed or the result is not a number.
    pub fn as_f64(&self) -> f64 {
        self.value().and_then(Value::as_f64).unwrap_or(f64::NAN)
    }

    pub fn into_result(self) -> Result<Value, InvokeFailure> {
        match self {
            InvokeOutcome::Completed(value) => Ok(value),
            InvokeOutcome::Failed(failure) => Err(failure),
        }
    }
}
