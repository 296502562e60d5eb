use std::io::Write;

use netbuf::Buf;

use io::Filter;


/// Output filter emitting HTTP/1.1 chunked framing
///
/// Every non-empty input becomes one chunk. An empty input with
/// `eof=false` produces no output at all, since a zero-length chunk would
/// read as the stream terminator.
pub struct ChunkedEncoder;

impl Filter for ChunkedEncoder {
    fn process(&mut self, input: &[u8], eof: bool) -> Buf {
        let mut out = Buf::new();
        if input.len() > 0 {
            write!(out, "{:x}\r\n", input.len()).unwrap();
            out.write_all(input).unwrap();
            out.write_all(b"\r\n").unwrap();
        }
        if eof {
            out.write_all(b"0\r\n\r\n").unwrap();
        }
        out
    }
}
