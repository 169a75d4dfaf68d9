//! Message encoding shared by the client and server.

use bytes::Bytes;
use rpc::frame::{FLAG_COMPRESSED, encode_envelope};
use rpc::{Encoding, Status};

/// Encodes outbound messages for one direction of a call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MessageWriter {
    encoding: Encoding,
    min_bytes: usize,
}

impl MessageWriter {
    pub(crate) fn new(encoding: Encoding, min_bytes: usize) -> Self {
        Self { encoding, min_bytes }
    }

    pub(crate) fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn should_compress(&self, len: usize) -> bool {
        !self.encoding.is_identity() && len >= self.min_bytes
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes, Status> {
        self.encoding
            .compress(data)
            .map_err(|e| Status::internal(format!("failed to compress message: {e}")))
    }

    /// Frame a message, compressing it when large enough.
    pub(crate) fn envelope(&self, message: &[u8]) -> Result<Bytes, Status> {
        if self.should_compress(message.len()) {
            let compressed = self.compress(message)?;
            return Ok(encode_envelope(FLAG_COMPRESSED, &compressed));
        }
        Ok(encode_envelope(0, message))
    }

    /// Encode a whole unenveloped body. Returns whether it was compressed.
    pub(crate) fn body(&self, message: Bytes) -> Result<(Bytes, bool), Status> {
        if self.should_compress(message.len()) {
            return Ok((self.compress(&message)?, true));
        }
        Ok((message, false))
    }
}

/// Parse an encoding header. Unknown names yield an error that only
/// matters once a compressed payload arrives.
pub(crate) fn encoding_from_header(value: Option<&str>) -> (Encoding, Option<Status>) {
    match value.map(str::trim) {
        None | Some("") => (Encoding::Identity, None),
        Some(name) => match name.parse::<Encoding>() {
            Ok(encoding) => (encoding, None),
            Err(_) => (
                Encoding::Identity,
                Some(Status::internal(format!(
                    "protocol error: peer used unsupported compression \"{name}\""
                ))),
            ),
        },
    }
}
