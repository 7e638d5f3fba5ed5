//! Length-prefixed message framing.
//!
//! Frame layout:
//!
//! ```text
//! +----------------+--------------------------------------------+
//! | length (varint)| payload                                    |
//! +----------------+--------------+-----------------------------+
//!                  | tag (varint) | body                        |
//!                  +--------------+-----------------------------+
//! tag = type_id << 1 | transformed
//! ```
//!
//! `length` counts the payload after any transform. Only `body` is ever
//! transformed; the tag stays readable so the receiver knows whether to
//! reverse the transform and which decoder to use.

use crate::error::ProtocolError;
use crate::varint;
use crate::{DEFAULT_MAX_PAYLOAD_SIZE, MAX_TYPE_ID};
use bytes::{Buf, Bytes, BytesMut};

/// Default initial capacity of a decoder's receive buffer.
const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Event or control type id.
    pub type_id: u32,
    /// Whether `body` has been forward-transformed.
    pub transformed: bool,
    /// Serialized fields, possibly transformed.
    pub body: Bytes,
}

impl Frame {
    /// Creates an untransformed frame.
    pub fn new(type_id: u32, body: Bytes) -> Self {
        Self {
            type_id,
            transformed: false,
            body,
        }
    }

    /// Creates a frame whose body was forward-transformed.
    pub fn transformed(type_id: u32, body: Bytes) -> Self {
        Self {
            type_id,
            transformed: true,
            body,
        }
    }

    /// Returns the payload tag.
    pub fn tag(&self) -> Result<u32, ProtocolError> {
        if self.type_id > MAX_TYPE_ID {
            return Err(ProtocolError::TypeOutOfRange(self.type_id));
        }
        Ok(self.type_id << 1 | u32::from(self.transformed))
    }

    /// Returns the payload length (tag + body).
    pub fn payload_len(&self) -> Result<usize, ProtocolError> {
        Ok(varint::encoded_len(self.tag()?) + self.body.len())
    }

    /// Appends the framed message to `buf`, returning the number of bytes written.
    pub fn encode_into(&self, buf: &mut BytesMut, max_payload: u32) -> Result<usize, ProtocolError> {
        let tag = self.tag()?;
        let payload_len = self.payload_len()?;
        if payload_len > max_payload as usize || payload_len > varint::MAX_VARINT_VALUE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len.min(u32::MAX as usize) as u32,
                max: max_payload,
            });
        }

        let start = buf.len();
        buf.reserve(varint::MAX_VARINT_LEN + payload_len);
        varint::encode(payload_len as u32, buf)?;
        varint::encode(tag, buf)?;
        buf.extend_from_slice(&self.body);
        Ok(buf.len() - start)
    }

    /// Encodes the frame into a standalone buffer.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf, DEFAULT_MAX_PAYLOAD_SIZE)?;
        Ok(buf.freeze())
    }

    /// Splits a complete payload into tag and body.
    pub fn from_payload(mut payload: Bytes) -> Result<Self, ProtocolError> {
        let (tag, used) = varint::decode(&payload)
            .ok_or(ProtocolError::MalformedPayload("truncated type tag"))?;
        payload.advance(used);
        Ok(Self {
            type_id: tag >> 1,
            transformed: tag & 1 == 1,
            body: payload,
        })
    }
}

/// Receive cursor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for a complete length prefix.
    Header,
    /// Length known, waiting for the payload.
    Body { len: usize },
    /// Discarding an oversized payload as it arrives.
    Skipping { remaining: usize },
}

/// Incremental frame decoder over a growable receive buffer.
///
/// Bytes are appended as they arrive from the socket; `next_frame` yields
/// complete frames one by one. Payloads are split off the buffer without
/// copying, and consumed space is reclaimed when the buffer next grows.
///
/// An `Err` from `next_frame` means exactly one message was skipped; the
/// decoder is already positioned at the next boundary and may be called again.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    max_payload: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
            state: State::Header,
            max_payload,
        }
    }

    /// Appends data to the receive buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the receive buffer with at least `additional` bytes of spare
    /// capacity, for reading directly from a socket.
    pub fn read_region(&mut self, additional: usize) -> &mut BytesMut {
        self.buffer.reserve(additional);
        &mut self.buffer
    }

    /// Attempts to decode the next frame.
    ///
    /// Returns `Ok(Some(frame))` for a complete frame, `Ok(None)` if more data
    /// is needed, or `Err` if one message was skipped.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                State::Skipping { remaining } => {
                    let n = remaining.min(self.buffer.len());
                    self.buffer.advance(n);
                    if n < remaining {
                        self.state = State::Skipping {
                            remaining: remaining - n,
                        };
                        return Ok(None);
                    }
                    tracing::trace!("Skipped oversized payload, resuming at next frame");
                    self.state = State::Header;
                }
                State::Header => {
                    let Some((len, used)) = varint::decode(&self.buffer) else {
                        return Ok(None);
                    };
                    self.buffer.advance(used);

                    if len > self.max_payload {
                        tracing::debug!(
                            "Discarding {}-byte payload (max {}), {} bytes buffered",
                            len,
                            self.max_payload,
                            self.buffer.len()
                        );
                        self.state = State::Skipping {
                            remaining: len as usize,
                        };
                        return Err(ProtocolError::FrameTooLarge {
                            size: len,
                            max: self.max_payload,
                        });
                    }
                    self.state = State::Body { len: len as usize };
                }
                State::Body { len } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(len).freeze();
                    self.state = State::Header;
                    return Frame::from_payload(payload).map(Some);
                }
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether the decoder sits between frames with nothing buffered.
    pub fn is_idle(&self) -> bool {
        self.state == State::Header && self.buffer.is_empty()
    }

    /// Clears the buffer and resets to the header state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Header;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
