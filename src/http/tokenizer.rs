//! Incremental zero-copy scratch buffer shared by the request parser.
//!
//! A [`Tokenizer`] owns one fixed-size buffer per session, sized once from
//! [`ReqLimits::estimated_buffer_size`](crate::config::ReqLimits). Bytes are
//! read into it from the socket, then sliced in place: every parsed token
//! (method, URL, header name/value) is a `&'static [u8]` pointing straight
//! into this buffer rather than an owned copy.

use crate::config::ReqLimits;
use memchr::memchr;
use std::{io, mem, time::Duration};
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, PartialEq)]
#[repr(align(64))]
pub(crate) struct Tokenizer {
    pub(crate) position: usize,
    pub(crate) len: usize,
    pub(crate) has_crlf: bool,
    buffer: Box<[u8]>,
}

impl Tokenizer {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        let buffer = vec![0; limits.clone().estimated_buffer_size()].into_boxed_slice();

        Tokenizer {
            position: 0,
            len: 0,
            has_crlf: false,
            buffer,
        }
    }

    #[cfg(test)]
    pub(crate) fn from<V: AsRef<[u8]>>(limits: &ReqLimits, value: V) -> Self {
        let mut buffer = vec![0; limits.clone().estimated_buffer_size()];

        let value = value.as_ref();
        buffer[0..value.len()].copy_from_slice(value);

        Tokenizer {
            position: 0,
            len: value.len(),
            has_crlf: false,
            buffer: buffer.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.position = 0;
        self.len = 0;
        self.has_crlf = false;
        self.buffer.fill(0);
    }
}

// Work with Buffer
impl Tokenizer {
    // Reading level
    /// Reads more bytes onto the tail of whatever is already buffered, so a
    /// request whose headers or body span multiple `recv` calls keeps what
    /// earlier calls delivered instead of losing it to the next overwrite.
    #[inline]
    pub(crate) async fn fill_buffer<R>(&mut self, reader: &mut R, time: Duration) -> io::Result<usize>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        if self.at_capacity() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request exceeds configured buffer size"));
        }

        tokio::select! {
            biased;

            read_result = reader.read(&mut self.buffer[self.len..]) => {
                let n = read_result?;
                self.len += n;
                Ok(n)
            }
            _ = tokio::time::sleep(time) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout"))
            },
        }
    }

    /// Whether the scratch buffer has no room left for another `fill_buffer`
    /// call — the request has grown as large as `ReqLimits` allows.
    #[inline(always)]
    pub(crate) fn at_capacity(&self) -> bool {
        self.len >= self.buffer.len()
    }

    /// Real bytes available from `start` onward — unlike the buffer's
    /// physical capacity, this stops at what `fill_buffer` has actually
    /// delivered so far.
    #[inline(always)]
    pub(crate) fn available_from(&self, start: usize) -> usize {
        self.len.saturating_sub(start)
    }

    /// True once either a full `step`-sized window of real bytes starting at
    /// `start` has been scanned without finding what the caller needs, or
    /// the buffer can't grow any further — in both cases no further read
    /// will change the outcome.
    #[inline(always)]
    pub(crate) fn scan_exhausted(&self, start: usize, step: usize) -> bool {
        self.available_from(start) >= step || self.at_capacity()
    }

    // Search level
    #[inline]
    pub(crate) fn find_slice(&mut self, limit: usize, delimiter: u8) -> Option<&[u8]> {
        let step = self.find_char(limit, delimiter)?;
        let last_index = self.update_position(step);
        self.get_slice(last_index, step)
    }

    /// Scans for `delimiter` within at most `step` bytes of real data from
    /// the current position — never past what `fill_buffer` has actually
    /// delivered, so a delimiter straddling the edge of buffered data reads
    /// as "not found yet" rather than matching stale zeroed memory.
    #[inline]
    pub(crate) fn find_char(&self, step: usize, delimiter: u8) -> Option<usize> {
        let bound = step.min(self.available_from(self.position));
        let slice = self.get_slice(self.position, bound)?;
        memchr(delimiter, slice)
    }

    // Low level
    #[inline(always)]
    pub(crate) fn get_slice(&self, start: usize, step: usize) -> Option<&[u8]> {
        self.buffer.get(start..start + step)
    }

    #[inline(always)]
    pub(crate) fn get_slice_mut(&mut self, start: usize, step: usize) -> Option<&mut [u8]> {
        self.buffer.get_mut(start..start + step)
    }

    #[inline(always)]
    pub(crate) fn update_position(&mut self, step: usize) -> usize {
        let old = self.position;
        self.position += step + 1;
        old
    }

    // Unsafe level
    #[inline(always)]
    pub(crate) fn get_slice_static(&self, start: usize, step: usize) -> Option<&'static [u8]> {
        let value = self.get_slice(start, step)?;
        unsafe { Some(Self::into_static(value)) }
    }

    #[inline(always)]
    // SAFETY: into_static produces references that outlive the borrow checker's
    // view of `self`, but never the buffer itself: the session that owns this
    // Tokenizer also owns the Request referencing into it, and both are reset
    // together at the start of the next request (see `Session::reset_cycle`).
    // A `Request` is never read after its owning Tokenizer's buffer is reused.
    const unsafe fn into_static(src: &[u8]) -> &'static [u8] {
        unsafe { mem::transmute(src) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::str;

    #[test]
    fn reset() {
        let limits = ReqLimits::default();
        let mut tokenizer = Tokenizer::new(&limits);

        tokenizer.position = 5;
        tokenizer.len = 10;
        tokenizer.has_crlf = true;
        tokenizer.buffer[0] = b'X';

        tokenizer.reset();

        assert_eq!(Tokenizer::new(&limits), tokenizer);
    }

    #[test]
    fn find_slice() {
        let limits = ReqLimits::default();
        let mut tokenizer = Tokenizer::from(&limits, b"GET / HTTP/1.1");

        let slice = tokenizer.find_slice(10, b' ').unwrap();
        assert_eq!(slice, b"GET");
        assert_eq!(tokenizer.position, 4);

        let slice = tokenizer.find_slice(10, b' ').unwrap();
        assert_eq!(slice, b"/");
    }

    #[test]
    fn find_char() {
        let limits = ReqLimits::default();
        let tokenizer = Tokenizer::from(&limits, b"hello world\nnext line");

        assert_eq!(tokenizer.find_char(20, b' '), Some(5));
        assert_eq!(tokenizer.find_char(20, b'\n'), Some(11));
        assert_eq!(tokenizer.find_char(5, b'x'), None);
    }

    #[test]
    fn get_slice() {
        let limits = ReqLimits::default();
        let tokenizer = Tokenizer::from(&limits, b"test data here");

        assert_eq!(str(tokenizer.get_slice(0, 4)), Some("test"));
        assert_eq!(str(tokenizer.get_slice(5, 4)), Some("data"));
    }

    #[test]
    fn get_slice_static() {
        let limits = ReqLimits::default();
        let tokenizer = Tokenizer::from(&limits, b"static data");

        assert_eq!(str(tokenizer.get_slice_static(0, 6)), Some("static"));
        assert_eq!(str(tokenizer.get_slice_static(7, 4)), Some("data"));
    }

    #[test]
    fn update_position() {
        let limits = ReqLimits::default();
        let mut tokenizer = Tokenizer::from(&limits, b"some data");

        let old_pos = tokenizer.update_position(4);
        assert_eq!(old_pos, 0);
        assert_eq!(tokenizer.position, 5);
    }
}
