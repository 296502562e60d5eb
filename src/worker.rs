use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use futures::{Future, Stream};
use futures::sync::mpsc::{unbounded, UnboundedSender};
use tokio_core::net::TcpStream;
use tokio_core::reactor::Core;

use director::TcpConnector;
use runtime::Handler;
use server::{Config, Proto};


enum Message {
    Connection(StdTcpStream, SocketAddr),
    Shutdown(Duration),
}

/// A single-threaded event loop owning a disjoint set of connections
///
/// Connections are pinned to their worker for their whole life. The
/// worker keeps accepting hand-offs until suspended or shut down;
/// suspension lets active connections drain, which is what hot-restart
/// choreography needs.
pub struct Worker {
    tx: UnboundedSender<Message>,
    thread: Option<thread::JoinHandle<()>>,
    suspended: Arc<AtomicBool>,
    load: Arc<AtomicUsize>,
}

/// A cheap clonable handle for assigning connections to a worker
#[derive(Clone)]
pub struct WorkerRef {
    tx: UnboundedSender<Message>,
}

impl WorkerRef {
    /// Hand an accepted socket to the worker
    ///
    /// When the worker is gone the socket comes back, so the caller can
    /// try the next one.
    pub fn assign(&self, sock: StdTcpStream, peer: SocketAddr)
        -> Result<(), (StdTcpStream, SocketAddr)>
    {
        self.tx.unbounded_send(Message::Connection(sock, peer))
            .map_err(|e| match e.into_inner() {
                Message::Connection(sock, peer) => (sock, peer),
                Message::Shutdown(..) => unreachable!(),
            })
    }
}

impl Worker {
    pub fn new(name: &str, cfg: &Arc<Config>, handler: &Arc<Handler>)
        -> Worker
    {
        let (tx, rx) = unbounded();
        let suspended = Arc::new(AtomicBool::new(false));
        let load = Arc::new(AtomicUsize::new(0));
        let thread = {
            let cfg = cfg.clone();
            let handler = handler.clone();
            let suspended = suspended.clone();
            let load = load.clone();
            thread::Builder::new().name(name.to_string()).spawn(move || {
                let mut core = Core::new()
                    .expect("can create an event loop");
                let handle = core.handle();
                let mut drain = Duration::new(0, 0);
                {
                    let spawn_handle = handle.clone();
                    let drain = &mut drain;
                    let done = rx.for_each(|message| {
                        match message {
                            Message::Connection(sock, peer) => {
                                if suspended.load(Ordering::SeqCst) {
                                    debug!("worker suspended, \
                                            refusing connection");
                                    return Ok(());
                                }
                                match TcpStream::from_stream(sock,
                                    &spawn_handle)
                                {
                                    Ok(sock) => {
                                        load.fetch_add(1, Ordering::SeqCst);
                                        let counter = load.clone();
                                        let proto = Proto::new(sock,
                                            &spawn_handle, &cfg, &handler,
                                            TcpConnector::new(&spawn_handle),
                                            Some(peer));
                                        spawn_handle.spawn(
                                            proto.then(move |result| {
                                                counter.fetch_sub(1,
                                                    Ordering::SeqCst);
                                                if let Err(e) = result {
                                                    info!("connection \
                                                        error: {}", e);
                                                }
                                                Ok(())
                                            }));
                                    }
                                    Err(e) => {
                                        error!("can't register \
                                            connection: {}", e);
                                    }
                                }
                                Ok(())
                            }
                            Message::Shutdown(deadline) => {
                                *drain = deadline;
                                Err(())
                            }
                        }
                    });
                    core.run(done).ok();
                }
                // bounded drain of the connections still in flight
                let deadline = Instant::now() + drain;
                while load.load(Ordering::SeqCst) > 0
                    && Instant::now() < deadline
                {
                    core.turn(Some(Duration::from_millis(100)));
                }
            }).expect("can spawn a worker thread")
        };
        Worker {
            tx: tx,
            thread: Some(thread),
            suspended: suspended,
            load: load,
        }
    }

    pub fn handle(&self) -> WorkerRef {
        WorkerRef {
            tx: self.tx.clone(),
        }
    }

    /// Connections currently alive on this worker
    pub fn active_connections(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    /// Stop accepting hand-offs, let active connections drain
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    /// Restore normal operation after a suspend
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    /// Stop the worker, waiting for active requests up to `drain`
    pub fn shutdown(mut self, drain: Duration) {
        self.tx.unbounded_send(Message::Shutdown(drain)).ok();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}
