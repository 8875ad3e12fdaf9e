//! Bridges arbitrarily large envelopes onto a channel with a fixed buffer size.

use exthost_core::IpcConfig;

use crate::envelope::Envelope;
use crate::frame::{ChunkFrame, FrameChannel, TransportError};

/// Size limits applied by a [`ChunkedTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    /// Maximum data bytes per chunk.
    pub buffer_size: usize,
    /// Maximum size of one reassembled envelope.
    pub max_message_bytes: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self::from(&IpcConfig::default())
    }
}

impl From<&IpcConfig> for TransportLimits {
    fn from(config: &IpcConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// Splits `bytes` into ordered chunks of at most `buffer_size` bytes.
///
/// The last chunk carries the final marker. An empty payload still produces
/// one (empty, final) chunk so the receiver sees a complete sequence.
pub fn split_into_chunks(bytes: &[u8], buffer_size: usize) -> Vec<ChunkFrame> {
    let buffer_size = buffer_size.max(1);
    if bytes.is_empty() {
        return vec![ChunkFrame {
            sequence_index: 0,
            is_final: true,
            data: Vec::new(),
        }];
    }
    let count = bytes.len().div_ceil(buffer_size);
    bytes
        .chunks(buffer_size)
        .enumerate()
        .map(|(index, data)| ChunkFrame {
            sequence_index: index as u32,
            is_final: index + 1 == count,
            data: data.to_vec(),
        })
        .collect()
}

/// Accumulates chunks of one envelope until its final chunk arrives.
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    next_index: u32,
    max_message_bytes: usize,
}

impl Reassembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            next_index: 0,
            max_message_bytes,
        }
    }

    /// Whether a sequence has started but not completed.
    pub fn in_progress(&self) -> bool {
        self.next_index != 0
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_index = 0;
    }

    /// Feeds one chunk; yields the payload once the final chunk completes a sequence.
    pub fn push(&mut self, frame: ChunkFrame) -> Result<Option<Vec<u8>>, TransportError> {
        if frame.sequence_index == 0 && self.in_progress() {
            tracing::warn!(
                discarded_chunks = self.next_index,
                discarded_bytes = self.buffer.len(),
                "New chunk sequence started before the previous one completed, discarding"
            );
            self.reset();
        } else if frame.sequence_index != self.next_index {
            let expected = self.next_index;
            self.reset();
            return Err(TransportError::OutOfSequence {
                expected,
                found: frame.sequence_index,
            });
        }

        let size = self.buffer.len() + frame.data.len();
        if size > self.max_message_bytes {
            self.reset();
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.max_message_bytes,
            });
        }
        self.buffer.extend_from_slice(&frame.data);

        if frame.is_final {
            self.next_index = 0;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        match self.next_index.checked_add(1) {
            Some(next) => self.next_index = next,
            None => {
                self.reset();
                return Err(TransportError::OutOfSequence {
                    expected: u32::MAX,
                    found: frame.sequence_index,
                });
            }
        }
        Ok(None)
    }
}

/// Sends and receives whole envelopes over a [`FrameChannel`].
pub struct ChunkedTransport {
    channel: Box<dyn FrameChannel>,
    limits: TransportLimits,
    reassembler: Reassembler,
    send_incomplete: bool,
}

impl ChunkedTransport {
    pub fn new(channel: Box<dyn FrameChannel>, limits: TransportLimits) -> Self {
        Self {
            channel,
            reassembler: Reassembler::new(limits.max_message_bytes),
            limits,
            send_incomplete: false,
        }
    }

    pub fn limits(&self) -> TransportLimits {
        self.limits
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope.encode()?;
        if bytes.len() > self.limits.max_message_bytes {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max: self.limits.max_message_bytes,
            });
        }

        let chunks = split_into_chunks(&bytes, self.limits.buffer_size);
        tracing::trace!(
            kind = %envelope.kind(),
            bytes = bytes.len(),
            chunks = chunks.len(),
            "Sending envelope"
        );
        self.send_incomplete = true;
        for chunk in chunks {
            self.channel.send_frame(chunk).await?;
        }
        self.send_incomplete = false;
        Ok(())
    }

    /// Next complete envelope, or `None` once the peer closed the channel.
    ///
    /// Cancel safe: a partially received sequence stays buffered for the next call.
    pub async fn receive(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            let Some(frame) = self.channel.recv_frame().await? else {
                if self.reassembler.in_progress() {
                    tracing::warn!(
                        "Peer closed the channel mid-sequence, discarding partial envelope"
                    );
                    self.reassembler.reset();
                }
                return Ok(None);
            };
            if let Some(bytes) = self.reassembler.push(frame)? {
                return Ok(Some(Envelope::decode(&bytes)?));
            }
        }
    }

    /// True when a send was interrupted part-way, leaving the peer mid-sequence.
    pub fn is_desynchronized(&self) -> bool {
        self.send_incomplete
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.reassembler.reset();
        self.channel.close().await
    }
}
