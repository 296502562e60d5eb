use std::cmp::min;
use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};

use futures::Async;
use netbuf::Buf;

use io::ChainFilter;


/// Largest slice a source hands out per pull
const PULL_CHUNK: usize = 16384;


/// A pull-based byte producer used to serialize a response body
///
/// `Ready(Some(slice))` yields bytes that stay valid until the next call
/// on the same source; copy them if you need them longer. `Ready(None)`
/// is end of stream, `NotReady` means the source cannot produce bytes yet.
pub trait Source {
    fn pull(&mut self) -> Result<Async<Option<&[u8]>>, io::Error>;

    /// Bytes this source will yield in total, when known upfront
    ///
    /// Lets the server compute a `Content-Length` where chunked framing
    /// is not available.
    fn total_len(&self) -> Option<u64> {
        None
    }
}

/// A writable endpoint for source bytes
pub trait Sink {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

impl Sink for Buf {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)
    }
}

/// Drain everything currently available from a source into a sink
pub fn pump<T, K>(source: &mut T, sink: &mut K)
    -> Result<Async<()>, io::Error>
    where T: Source + ?Sized, K: Sink + ?Sized
{
    loop {
        match source.pull()? {
            Async::Ready(Some(data)) => sink.send(data)?,
            Async::Ready(None) => return Ok(Async::Ready(())),
            Async::NotReady => return Ok(Async::NotReady),
        }
    }
}


/// A source yielding the contents of an owned buffer
pub struct BufferSource {
    data: Buf,
    pos: usize,
}

impl BufferSource {
    pub fn new(data: Buf) -> BufferSource {
        BufferSource {
            data: data,
            pos: 0,
        }
    }

    /// Build a source from a copy of the given bytes
    pub fn copy(data: &[u8]) -> BufferSource {
        let mut buf = Buf::new();
        buf.write_all(data).unwrap();
        BufferSource::new(buf)
    }
}

impl Source for BufferSource {
    fn pull(&mut self) -> Result<Async<Option<&[u8]>>, io::Error> {
        if self.pos >= self.data.len() {
            return Ok(Async::Ready(None));
        }
        let start = self.pos;
        self.pos = min(self.data.len(), start + PULL_CHUNK);
        Ok(Async::Ready(Some(&self.data[start..self.pos])))
    }

    fn total_len(&self) -> Option<u64> {
        Some((self.data.len() - self.pos) as u64)
    }
}


/// A source yielding a byte range of a file
///
/// Reads are positional and bounded, so several sources may share one
/// file description. Reads happen on the worker thread; files on ordinary
/// filesystems do not block meaningfully.
pub struct FileSource {
    file: File,
    offset: u64,
    left: u64,
    chunk: Vec<u8>,
}

impl FileSource {
    pub fn new(file: File, offset: u64, len: u64) -> FileSource {
        FileSource {
            file: file,
            offset: offset,
            left: len,
            chunk: vec![0; min(len, PULL_CHUNK as u64) as usize],
        }
    }
}

impl Source for FileSource {
    fn pull(&mut self) -> Result<Async<Option<&[u8]>>, io::Error> {
        if self.left == 0 {
            return Ok(Async::Ready(None));
        }
        self.file.seek(SeekFrom::Start(self.offset))?;
        let want = min(self.left, self.chunk.len() as u64) as usize;
        let bytes = self.file.read(&mut self.chunk[..want])?;
        if bytes == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                "file shorter than the requested range"));
        }
        self.offset += bytes as u64;
        self.left -= bytes as u64;
        Ok(Async::Ready(Some(&self.chunk[..bytes])))
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.left)
    }
}


/// A source pulling another source through a filter chain
///
/// One response may consist of several filtered sources sharing the same
/// chain, so a plain `FilterSource` never signals end-of-stream to its
/// filters. The `flush` variant is the end-of-stream marker enqueued
/// exactly once per response; it passes `eof=true` through the chain,
/// letting filters emit their trailers.
pub struct FilterSource {
    chain: ChainFilter,
    inner: Option<Box<Source>>,
    pending: Buf,
    served: bool,
    eof: bool,
}

impl FilterSource {
    pub fn new(chain: ChainFilter, inner: Box<Source>) -> FilterSource {
        FilterSource {
            chain: chain,
            inner: Some(inner),
            pending: Buf::new(),
            served: false,
            eof: false,
        }
    }

    /// An end-of-stream marker flushing the chain
    pub fn flush(chain: ChainFilter) -> FilterSource {
        FilterSource {
            chain: chain,
            inner: None,
            pending: Buf::new(),
            served: false,
            eof: false,
        }
    }
}

impl Source for FilterSource {
    fn pull(&mut self) -> Result<Async<Option<&[u8]>>, io::Error> {
        if self.served {
            let len = self.pending.len();
            self.pending.consume(len);
            self.served = false;
        }
        while self.pending.len() == 0 {
            if self.eof {
                return Ok(Async::Ready(None));
            }
            let produced = match self.inner {
                Some(ref mut src) => match src.pull()? {
                    Async::Ready(Some(data)) => {
                        self.chain.process(data, false)
                    }
                    Async::Ready(None) => {
                        self.eof = true;
                        continue;
                    }
                    Async::NotReady => return Ok(Async::NotReady),
                },
                None => {
                    self.eof = true;
                    self.chain.process(b"", true)
                }
            };
            self.pending = produced;
        }
        self.served = true;
        Ok(Async::Ready(Some(&self.pending[..])))
    }
}
