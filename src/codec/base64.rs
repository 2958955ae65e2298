//! Base64 encode/decode, used for the WebSocket handshake and exposed for
//! general handler use.
//!
//! Wraps the `base64` crate's standard engine (RFC 4648 alphabet, `=`
//! padding). The standard engine rejects embedded `=` padding outside the
//! final 1-2 positions, unlike a naive decoder that would treat every `=` as
//! the value zero.

use base64::{engine::general_purpose::STANDARD, DecodeError, Engine};

/// Encodes `input` as a Base64 string.
#[inline]
pub(crate) fn encode(input: &[u8]) -> String {
    STANDARD.encode(input)
}

/// Decodes a Base64 string back into bytes.
#[inline]
pub(crate) fn decode(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(input)
}

/// Exact encoded length for `input_len` bytes of input (`0` for `0`).
#[inline]
pub(crate) const fn encoded_length(input_len: usize) -> usize {
    if input_len == 0 {
        return 0;
    }
    input_len.div_ceil(3) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for sample in [&b""[..], b"f", b"fo", b"foo", b"foob", b"fooba", b"foobar"] {
            assert_eq!(decode(encode(sample).as_bytes()).unwrap(), sample);
        }
    }

    #[test]
    fn encoded_length_matches_rfc_4648_table() {
        assert_eq!(encoded_length(0), 0);
        assert_eq!(encoded_length(1), 4);
        assert_eq!(encoded_length(2), 4);
        assert_eq!(encoded_length(3), 4);
        assert_eq!(encoded_length(4), 8);
        assert_eq!(encoded_length(20), 28);
    }

    #[test]
    fn rejects_embedded_padding() {
        assert!(decode(b"Zm9=vYmFy").is_err());
    }

    #[test]
    fn websocket_accept_key_example() {
        // RFC 6455 section 1.3 worked example.
        let digest = crate::codec::sha1::digest(b"dGhlIHNhbXBsZSBub25jZQ==258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
        assert_eq!(encode(&digest), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
