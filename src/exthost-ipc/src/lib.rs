//! Message channel between the host application and out-of-process extensions.
//!
//! Envelopes are JSON documents tagged by kind. They are split into chunk frames
//! no larger than the configured buffer size and reassembled on the other side.
//! [`Connection`] is the host-application view of one extension service; the
//! [`host`] module is the extension side.

pub mod chunked;
pub mod connection;
pub mod connector;
pub mod envelope;
pub mod frame;
pub mod host;

pub use chunked::{split_into_chunks, ChunkedTransport, Reassembler, TransportLimits};
pub use connection::{
    Connection, ConnectionError, ConnectionOptions, ConnectionStatus, ProgressCallback,
};
pub use connector::{
    ConnectedChannel, Connector, ConnectorError, Endpoint, LaunchSpec, LocalSocketConnector,
    ServiceTarget, ENDPOINT_ENV,
};
pub use envelope::{
    Envelope, EnvelopeKind, Progress, ProtocolError, RemoteError, RemoteErrorKind, WorkRequest,
    WorkResult,
};
pub use frame::{memory_pair, ChunkFrame, FrameChannel, MemoryChannel, StreamChannel, TransportError};
pub use host::{
    serve_channel, serve_endpoint, HandlerError, HostError, ProgressReporter, ServeExit,
    WorkHandler,
};
