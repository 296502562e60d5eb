use std::io;

use futures::Future;
use futures::future;
use tokio_core::net::TcpStream;
use tokio_core::reactor::Handle;
use tokio_io::{AsyncRead, AsyncWrite};

use director::BackendAddr;


/// Opens connections to backends
///
/// Abstracting the connection factory keeps the proxy testable with mock
/// sockets and leaves room for connectors that know about unix sockets or
/// TLS upstreams.
pub trait Connect {
    type Io: AsyncRead + AsyncWrite;
    type Future: Future<Item=Self::Io, Error=io::Error>;

    fn connect(&self, addr: &BackendAddr) -> Self::Future;
}

/// The plain TCP connector
pub struct TcpConnector {
    handle: Handle,
}

impl TcpConnector {
    pub fn new(handle: &Handle) -> TcpConnector {
        TcpConnector {
            handle: handle.clone(),
        }
    }
}

impl Connect for TcpConnector {
    type Io = TcpStream;
    type Future = Box<Future<Item=TcpStream, Error=io::Error>>;

    fn connect(&self, addr: &BackendAddr) -> Self::Future {
        match *addr {
            BackendAddr::Tcp(sock_addr) => {
                Box::new(TcpStream::connect(&sock_addr, &self.handle))
            }
            BackendAddr::Unix(..) => {
                Box::new(future::err(io::Error::new(io::ErrorKind::Other,
                    "unix-socket backends need a custom connector")))
            }
        }
    }
}
