//! Chunk frames and the raw duplex channels that carry them.
//!
//! A [`FrameChannel`] moves whole frames whose data never exceeds the channel's
//! buffer size. Byte streams (local sockets, named pipes, `tokio::io::duplex`)
//! are framed by [`StreamChannel`] with a fixed 7-byte header:
//!
//! ```text
//! +----------------+-------+-------------+----------------+
//! | sequence (u32) | flags | length (u16)| data (length)  |
//! +----------------+-------+-------------+----------------+
//! ```
//!
//! Integers are big-endian; flag bit 0 marks the final chunk of an envelope.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::envelope::ProtocolError;

pub const FRAME_HEADER_LEN: usize = 7;

const FLAG_FINAL: u8 = 0b0000_0001;
const READ_CHUNK: usize = 4096;

/// One transport-sized fragment of a serialized envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub sequence_index: u32,
    pub is_final: bool,
    pub data: Vec<u8>,
}

impl ChunkFrame {
    /// Appends the wire form of this frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>, max_data: usize) -> Result<(), TransportError> {
        let len = self.data.len();
        if len > max_data || len > u16::MAX as usize {
            return Err(TransportError::FrameTooLarge {
                len,
                max: max_data.min(u16::MAX as usize),
            });
        }
        out.reserve(FRAME_HEADER_LEN + len);
        out.extend_from_slice(&self.sequence_index.to_be_bytes());
        out.push(if self.is_final { FLAG_FINAL } else { 0 });
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        Ok(())
    }

    /// Parses one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied, or `None` when `buf`
    /// does not yet hold a complete frame.
    pub fn decode(buf: &[u8], max_data: usize) -> Result<Option<(Self, usize)>, TransportError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let sequence_index = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let flags = buf[4];
        if flags & !FLAG_FINAL != 0 {
            return Err(TransportError::InvalidHeader { flags });
        }
        let len = u16::from_be_bytes([buf[5], buf[6]]) as usize;
        if len > max_data {
            return Err(TransportError::FrameTooLarge { len, max: max_data });
        }
        let total = FRAME_HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }
        let frame = Self {
            sequence_index,
            is_final: flags & FLAG_FINAL != 0,
            data: buf[FRAME_HEADER_LEN..total].to_vec(),
        };
        Ok(Some((frame, total)))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel closed by peer")]
    Closed,
    #[error("chunk of {len} bytes exceeds the {max}-byte buffer")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid frame header flags {flags:#04x}")]
    InvalidHeader { flags: u8 },
    #[error("chunk {found} arrived while chunk {expected} was expected")]
    OutOfSequence { expected: u32, found: u32 },
    #[error("message of {size} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Generic duplex channel moving whole chunk frames.
#[async_trait]
pub trait FrameChannel: Send {
    async fn send_frame(&mut self, frame: ChunkFrame) -> Result<(), TransportError>;

    /// Next frame from the peer, or `None` once the peer has closed the channel.
    ///
    /// Implementations must be cancel safe: dropping the future loses no data.
    async fn recv_frame(&mut self) -> Result<Option<ChunkFrame>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Frames a byte stream with the fixed header described in the module docs.
pub struct StreamChannel<S> {
    io: S,
    max_data: usize,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(io: S, max_data: usize) -> Self {
        Self {
            io,
            max_data,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<S> FrameChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send_frame(&mut self, frame: ChunkFrame) -> Result<(), TransportError> {
        self.write_buf.clear();
        frame.encode_into(&mut self.write_buf, self.max_data)?;
        self.io.write_all(&self.write_buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Option<ChunkFrame>, TransportError> {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            if let Some((frame, used)) = ChunkFrame::decode(&self.read_buf, self.max_data)? {
                self.read_buf.drain(..used);
                return Ok(Some(frame));
            }
            // `read` is cancel safe; bytes land in `read_buf` before the next await.
            let n = self.io.read(&mut scratch).await?;
            if n == 0 {
                if !self.read_buf.is_empty() {
                    tracing::debug!(
                        pending_bytes = self.read_buf.len(),
                        "Peer closed the stream mid-frame"
                    );
                    self.read_buf.clear();
                }
                return Ok(None);
            }
            self.read_buf.extend_from_slice(&scratch[..n]);
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// In-process channel endpoint; create connected pairs with [`memory_pair`].
pub struct MemoryChannel {
    tx: Option<mpsc::Sender<ChunkFrame>>,
    rx: mpsc::Receiver<ChunkFrame>,
    max_data: usize,
}

/// Two connected in-process channel endpoints.
pub fn memory_pair(max_data: usize, capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
    (
        MemoryChannel {
            tx: Some(a_tx),
            rx: a_rx,
            max_data,
        },
        MemoryChannel {
            tx: Some(b_tx),
            rx: b_rx,
            max_data,
        },
    )
}

#[async_trait]
impl FrameChannel for MemoryChannel {
    async fn send_frame(&mut self, frame: ChunkFrame) -> Result<(), TransportError> {
        if frame.data.len() > self.max_data {
            return Err(TransportError::FrameTooLarge {
                len: frame.data.len(),
                max: self.max_data,
            });
        }
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn recv_frame(&mut self) -> Result<Option<ChunkFrame>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}
