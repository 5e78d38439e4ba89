//! Wire framing for the two channel kinds.
//!
//! Datagram frames carry no length field; the datagram boundary delimits the
//! payload:
//!
//! ```text
//! +-------------------+--------------------+
//! | opcode (2 bytes)  |   payload          |
//! | u16 little-endian |   (rest of packet) |
//! +-------------------+--------------------+
//! ```
//!
//! Stream frames are length-prefixed so they can be recovered from a byte
//! stream that delivers partial or concatenated chunks:
//!
//! ```text
//! +-------------------+-------------------+--------------------+
//! | length (4 bytes)  | opcode (2 bytes)  |   payload          |
//! | u32 little-endian | u16 little-endian |   (length-2 bytes) |
//! +-------------------+-------------------+--------------------+
//! ```
//!
//! The length covers opcode and payload, never the 4 prefix bytes. In both
//! shapes the opcode is the first two bytes of the payload region, so a
//! single dispatch step serves either channel.

/// Application-assigned message kind.
pub type Opcode = u16;

/// Size of the opcode field.
pub const OPCODE_LEN: usize = 2;

/// Size of the stream frame length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound for the `length` field of a stream frame (16 MiB).
pub const DEFAULT_MAX_STREAM_FRAME: u32 = 16 * 1024 * 1024;

/// The channel a frame travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Unordered, best-effort, size-bounded datagrams.
    Unreliable,
    /// Ordered byte stream.
    Reliable,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Unreliable => f.write_str("datagram"),
            ChannelKind::Reliable => f.write_str("stream"),
        }
    }
}

/// A decoded frame: message kind plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message kind.
    pub opcode: Opcode,
    /// Payload bytes following the opcode.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame from its parts.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }
}

/// Errors that can occur while decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// A datagram shorter than the opcode field.
    #[error("frame too short: {len} bytes, need at least {OPCODE_LEN}")]
    TooShort {
        /// Number of bytes received.
        len: usize,
    },

    /// A stream frame whose length field cannot even hold an opcode.
    #[error("malformed stream frame length {length}")]
    MalformedLength {
        /// The length field as read from the wire.
        length: u32,
    },

    /// A stream frame larger than the configured maximum.
    #[error("stream frame length {length} exceeds maximum {max}")]
    FrameTooLarge {
        /// The length field as read from the wire.
        length: u32,
        /// The configured maximum.
        max: u32,
    },

    /// An outbound payload that does not fit in one stream frame.
    #[error("payload of {len} bytes does not fit a stream frame of at most {max}")]
    PayloadTooLarge {
        /// Payload size in bytes.
        len: usize,
        /// The largest allowed frame length.
        max: u32,
    },
}

/// Encode a datagram frame: `[opcode][payload]`.
///
/// No size bound is applied here; the datagram channel may still refuse an
/// oversized packet, which is a transport error.
pub fn encode_datagram(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OPCODE_LEN + payload.len());
    out.extend_from_slice(&opcode.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a stream frame: `[length][opcode][payload]`.
///
/// Fails when the length does not fit the 32-bit prefix.
pub fn encode_stream_frame(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode_bounded_stream_frame(opcode, payload, u32::MAX)
}

/// Like [`encode_stream_frame`], rejecting frames whose length field would
/// exceed `max_frame`, the same bound the receiving side enforces.
pub fn encode_bounded_stream_frame(
    opcode: Opcode,
    payload: &[u8],
    max_frame: u32,
) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(OPCODE_LEN + payload.len())
        .ok()
        .filter(|len| *len <= max_frame)
        .ok_or(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: max_frame,
        })?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + OPCODE_LEN + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&opcode.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode a datagram frame. Everything after the opcode is payload.
pub fn decode_datagram(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < OPCODE_LEN {
        return Err(FrameError::TooShort { len: bytes.len() });
    }
    let opcode = Opcode::from_le_bytes([bytes[0], bytes[1]]);
    Ok(Frame::new(opcode, &bytes[OPCODE_LEN..]))
}

/// Decode every complete stream frame at the front of `buffer`.
///
/// Returns the frames plus the unconsumed remainder, which the caller keeps
/// and prepends to the next read. A frame is only consumed once all of its
/// bytes are present, so any chunking of the stream yields the same frames.
pub fn decode_stream_frames(
    buffer: &[u8],
    max_frame: u32,
) -> Result<(Vec<Frame>, &[u8]), FrameError> {
    let mut frames = Vec::new();
    let mut rest = buffer;

    while rest.len() >= LENGTH_PREFIX_LEN {
        let length = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        if (length as usize) < OPCODE_LEN {
            return Err(FrameError::MalformedLength { length });
        }
        if length > max_frame {
            return Err(FrameError::FrameTooLarge {
                length,
                max: max_frame,
            });
        }

        let total = LENGTH_PREFIX_LEN + length as usize;
        if rest.len() < total {
            break;
        }

        let body = &rest[LENGTH_PREFIX_LEN..total];
        let opcode = Opcode::from_le_bytes([body[0], body[1]]);
        frames.push(Frame::new(opcode, &body[OPCODE_LEN..]));
        rest = &rest[total..];
    }

    Ok((frames, rest))
}

/// Accumulates reliable-channel reads and yields complete frames.
///
/// Holds the remainder returned by [`decode_stream_frames`] between reads.
#[derive(Debug)]
pub struct StreamReassembler {
    pending: Vec<u8>,
    max_frame: u32,
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAM_FRAME)
    }
}

impl StreamReassembler {
    /// Create a reassembler that rejects frames longer than `max_frame`.
    pub fn new(max_frame: u32) -> Self {
        Self {
            pending: Vec::new(),
            max_frame,
        }
    }

    /// Append a chunk read from the stream and drain every complete frame.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.pending.extend_from_slice(chunk);
        let (frames, rest) = decode_stream_frames(&self.pending, self.max_frame)?;
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
