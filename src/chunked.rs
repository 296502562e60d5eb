use httparse::{InvalidChunkSize, parse_chunk_size};
use netbuf::Buf;


/// Incremental decoder for chunked transfer coding
///
/// The decoder works in place: framing bytes (chunk-size lines, the
/// delimiters between chunks and the trailer section) are removed from the
/// buffer as they are recognized, so `buf[..buffered()]` is always pure
/// body data ready to hand out.
#[derive(Debug, Clone)]
pub struct State {
    buffered: usize,
    pending: u64,
    delimiter: bool,
    trailer: bool,
    done: bool,
}

impl State {
    pub fn new() -> State {
        State {
            buffered: 0,
            pending: 0,
            delimiter: false,
            trailer: false,
            done: false,
        }
    }

    pub fn parse(&mut self, buf: &mut Buf) -> Result<(), InvalidChunkSize> {
        while self.buffered < buf.len() && !self.done {
            if self.pending > 0 {
                let available = (buf.len() - self.buffered) as u64;
                if available < self.pending {
                    self.pending -= available;
                    self.buffered = buf.len();
                } else {
                    self.buffered += self.pending as usize;
                    self.pending = 0;
                    self.delimiter = true;
                }
            } else if self.delimiter {
                if !self.skip_line_end(buf)? {
                    return Ok(());
                }
                self.delimiter = false;
            } else if self.trailer {
                match find_line_end(&buf[self.buffered..]) {
                    Some((end, blank)) => {
                        buf.remove_range(self.buffered..self.buffered+end);
                        if blank {
                            self.trailer = false;
                            self.done = true;
                        }
                    }
                    None => return Ok(()),
                }
            } else {
                use httparse::Status::*;
                match parse_chunk_size(&buf[self.buffered..])? {
                    Complete((bytes, 0)) => {
                        buf.remove_range(self.buffered..self.buffered+bytes);
                        self.trailer = true;
                    }
                    Complete((bytes, chunk_size)) => {
                        buf.remove_range(self.buffered..self.buffered+bytes);
                        self.pending = chunk_size;
                    }
                    Partial => {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Strips the CRLF (or lone LF) that terminates a data chunk
    ///
    /// Returns false if more bytes are needed.
    fn skip_line_end(&mut self, buf: &mut Buf)
        -> Result<bool, InvalidChunkSize>
    {
        let strip = {
            let tail = &buf[self.buffered..];
            if tail.len() == 0 {
                return Ok(false);
            } else if tail[0] == b'\n' {
                1
            } else if tail[0] == b'\r' {
                if tail.len() < 2 {
                    return Ok(false);
                } else if tail[1] == b'\n' {
                    2
                } else {
                    return Err(InvalidChunkSize);
                }
            } else {
                return Err(InvalidChunkSize);
            }
        };
        buf.remove_range(self.buffered..self.buffered+strip);
        Ok(true)
    }

    /// Number of decoded data bytes at the start of the buffer
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Tell the decoder the caller consumed `n` decoded bytes
    pub fn consume(&mut self, n: usize) {
        assert!(self.buffered >= n);
        self.buffered -= n;
    }
}

/// Finds the end of the first line, reporting whether the line is blank
fn find_line_end(data: &[u8]) -> Option<(usize, bool)> {
    for (idx, &ch) in data.iter().enumerate() {
        if ch == b'\n' {
            let blank = idx == 0 || (idx == 1 && data[0] == b'\r');
            return Some((idx + 1, blank));
        }
    }
    None
}
