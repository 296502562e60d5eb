use httparse::InvalidChunkSize;
use netbuf::Buf;

use chunked;

/// Progress of reading a message body with a known framing
#[derive(Debug, Clone)]
pub enum BodyProgress {
    /// Content-Length framing (bytes left)
    Fixed(u64),
    /// Read-until-EOF framing, responses only
    Eof,
    Chunked(chunked::State),
}

impl BodyProgress {
    /// Returns the number of body bytes ready at the head of the buffer
    /// and whether the body is complete
    ///
    /// `end` tells whether the peer closed its writing side.
    pub fn check_buf(&self, buf: &Buf, end: bool) -> (usize, bool) {
        use self::BodyProgress::*;
        match *self {
            Fixed(x) if x <= buf.len() as u64 => (x as usize, true),
            Fixed(_) => (buf.len(), false),
            Chunked(ref s) => (s.buffered(), s.is_done()),
            Eof => (buf.len(), end),
        }
    }
    pub fn parse(&mut self, buf: &mut Buf)
        -> Result<(), InvalidChunkSize>
    {
        use self::BodyProgress::*;
        match *self {
            Fixed(_) => {}
            Chunked(ref mut s) => s.parse(buf)?,
            Eof => {}
        }
        Ok(())
    }
    /// Remove `n` delivered bytes from the head of the buffer
    pub fn consume(&mut self, buf: &mut Buf, n: usize) {
        use self::BodyProgress::*;
        buf.consume(n);
        match *self {
            Fixed(ref mut x) => {
                assert!(*x >= n as u64);
                *x -= n as u64;
            }
            Chunked(ref mut s) => s.consume(n),
            Eof => {}
        }
    }
}
