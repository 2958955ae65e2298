//! SHA-1 digest, used only to derive the WebSocket `Sec-WebSocket-Accept` key.
//!
//! A single-shot wrapper over the `sha1` crate's incremental `Sha1` context;
//! the handshake never needs a streaming digest, so `digest` is the only
//! entry point callers need.

use sha1::{Digest, Sha1};

pub(crate) const HASH_SIZE: usize = 20;

/// Returns the 20-byte SHA-1 digest of `data`.
#[inline]
pub(crate) fn digest(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha1::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 3174, Appendix A, test vectors 1 and 3.
    #[test]
    fn rfc_3174_short_message() {
        let hash = digest(b"abc");
        assert_eq!(
            hash,
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
                0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
            ]
        );
    }

    #[test]
    fn rfc_3174_one_million_a() {
        let data = vec![b'a'; 1_000_000];
        let hash = digest(&data);
        assert_eq!(
            hash,
            [
                0x34, 0xaa, 0x97, 0x3c, 0xd4, 0xc4, 0xda, 0xa4, 0xf6, 0x1e, 0xeb, 0x2b, 0xdb, 0xad,
                0x27, 0x31, 0x65, 0x34, 0x01, 0x6f,
            ]
        );
    }
}
