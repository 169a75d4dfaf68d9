//! Trailer muxing for unary responses on transports without trailers.
//!
//! A trailer `x` travels as the header `trailer-x`. Every prefixed header is
//! a trailer on the way back in, even if a real header with that name was
//! intended.

use crate::metadata::HeaderSet;

/// Prefix marking a header as a muxed trailer.
pub const TRAILER_PREFIX: &str = "trailer-";

/// Split a header set into headers and trailers.
pub fn demux(headers: &HeaderSet) -> (HeaderSet, HeaderSet) {
    let mut plain = HeaderSet::new();
    let mut trailers = HeaderSet::new();

    for (key, values) in headers.entries() {
        // keys are lowercase so the prefix check is case-insensitive
        match key.strip_prefix(TRAILER_PREFIX) {
            Some(name) => trailers.set_all(name, values.to_vec()),
            None => plain.set_all(key, values.to_vec()),
        }
    }

    (plain, trailers)
}

/// Merge trailers into a header set under the trailer prefix.
///
/// Trailer values replace any header already using the prefixed name.
pub fn mux(headers: &HeaderSet, trailers: &HeaderSet) -> HeaderSet {
    let mut merged = headers.clone();
    for (key, values) in trailers.entries() {
        merged.set_all(format!("{TRAILER_PREFIX}{key}"), values.to_vec());
    }
    merged
}
