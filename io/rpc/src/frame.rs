//! Length-prefixed message framing.
//!
//! Every streaming protocol frames messages as:
//! - 1 byte: flags
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload
//!
//! Flags: `0x01` compressed, `0x02` Triple end-of-stream, `0x80` gRPC-Web
//! trailers.

use crate::status::Status;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the envelope header (1 byte flags + 4 bytes length).
pub const HEADER_SIZE: usize = 5;

/// Maximum message size (4MB default, matches gRPC default).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_END_STREAM: u8 = 0x02;
pub const FLAG_TRAILERS: u8 = 0x80;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub data: Bytes,
}

impl Envelope {
    pub fn message(data: Bytes, compressed: bool) -> Self {
        Self {
            flags: if compressed { FLAG_COMPRESSED } else { 0 },
            data,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_trailers(&self) -> bool {
        self.flags & FLAG_TRAILERS != 0
    }
}

/// Encode a payload with the given flags.
pub fn encode_envelope(flags: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buf.put_u8(flags);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Decode a single envelope.
///
/// Returns `Ok(Some(envelope))` if a complete envelope was decoded,
/// `Ok(None)` if more data is needed, or `Err` when the declared length
/// exceeds `max_size`.
pub fn decode_envelope(buf: &mut BytesMut, max_size: usize) -> Result<Option<Envelope>, Status> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    // Peek at header without consuming
    let flags = buf[0];
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

    if length > max_size {
        return Err(Status::resource_exhausted(format!(
            "message size {length} is larger than read_max_bytes {max_size}"
        )));
    }

    if buf.len() < HEADER_SIZE + length {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let data = buf.split_to(length).freeze();

    Ok(Some(Envelope { flags, data }))
}

/// Stateful decoder for a stream of envelopes.
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: BytesMut,
    max_size: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl MessageDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_size,
        }
    }

    /// Feed data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next envelope.
    pub fn decode(&mut self) -> Result<Option<Envelope>, Status> {
        decode_envelope(&mut self.buffer, self.max_size)
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
