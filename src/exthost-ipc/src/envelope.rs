//! Message envelopes exchanged between the host application and extension processes.
//!
//! Every envelope is serialized as JSON of the form `{"type": "<tag>", "payload": {...}}`.
//! The `type` tag selects the concrete payload shape, so a receiver can decode any
//! message without knowing in advance which one is coming.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Top-level message unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Envelope {
    /// Work for the extension to perform.
    WorkRequest(WorkRequest),
    /// Successful terminal answer to a work request.
    WorkResult(WorkResult),
    /// Non-terminal progress update for the request being processed.
    Progress(Progress),
    /// Failed terminal answer to a work request.
    Error(RemoteError),
    /// Ask the host process to close the channel and exit.
    Shutdown,
}

/// Discriminator for [`Envelope`] variants, as written in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    WorkRequest,
    WorkResult,
    Progress,
    Error,
    Shutdown,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 5] = [
        EnvelopeKind::WorkRequest,
        EnvelopeKind::WorkResult,
        EnvelopeKind::Progress,
        EnvelopeKind::Error,
        EnvelopeKind::Shutdown,
    ];

    pub fn as_tag(&self) -> &'static str {
        match self {
            EnvelopeKind::WorkRequest => "WorkRequest",
            EnvelopeKind::WorkResult => "WorkResult",
            EnvelopeKind::Progress => "Progress",
            EnvelopeKind::Error => "Error",
            EnvelopeKind::Shutdown => "Shutdown",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_tag() == tag)
    }

    /// Whether this envelope ends a request (exactly one per request).
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeKind::WorkResult | EnvelopeKind::Error)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A request for the extension's business logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Operation name understood by the extension.
    pub operation: String,
    /// Operation-specific arguments.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

impl WorkRequest {
    pub fn new(operation: impl Into<String>, arguments: Value) -> Self {
        Self {
            operation: operation.into(),
            arguments,
        }
    }
}

/// Terminal answer to a [`WorkRequest`].
///
/// A result without a `result` field is malformed from the caller's point of view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl WorkResult {
    pub fn new(result: Value) -> Self {
        Self {
            result: Some(result),
        }
    }
}

/// Progress of the request currently being processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// 0..=100
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error answer produced by the extension process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The extension does not implement the requested operation.
    UnknownOperation,
    /// Arguments were missing or of the wrong shape.
    InvalidArguments,
    /// The envelope type tag was not understood.
    UnrecognizedMessage,
    /// The envelope was understood but not expected at this point.
    UnexpectedMessage,
    /// The operation itself failed.
    Internal,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to serialize {kind} envelope: {source}")]
    Serialize {
        kind: EnvelopeKind,
        source: serde_json::Error,
    },
    #[error("message is not an envelope: {0}")]
    NotAnEnvelope(serde_json::Error),
    #[error("unrecognized message type {tag:?}")]
    Unrecognized { tag: String },
    #[error("malformed {tag} payload: {source}")]
    Malformed {
        tag: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct TypeHeader {
    #[serde(rename = "type")]
    type_tag: String,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::WorkRequest(_) => EnvelopeKind::WorkRequest,
            Envelope::WorkResult(_) => EnvelopeKind::WorkResult,
            Envelope::Progress(_) => EnvelopeKind::Progress,
            Envelope::Error(_) => EnvelopeKind::Error,
            Envelope::Shutdown => EnvelopeKind::Shutdown,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|source| ProtocolError::Serialize {
            kind: self.kind(),
            source,
        })
    }

    /// Decodes an envelope, reporting unknown type tags as [`ProtocolError::Unrecognized`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header: TypeHeader =
            serde_json::from_slice(bytes).map_err(ProtocolError::NotAnEnvelope)?;
        let Some(kind) = EnvelopeKind::from_tag(&header.type_tag) else {
            return Err(ProtocolError::Unrecognized {
                tag: header.type_tag,
            });
        };
        serde_json::from_slice(bytes).map_err(|source| ProtocolError::Malformed {
            tag: kind.as_tag(),
            source,
        })
    }
}
