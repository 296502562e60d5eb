use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use worker::WorkerRef;


/// Accepts inbound sockets and assigns them to workers round-robin
///
/// The accept loop runs on its own thread; each accepted socket is handed
/// to exactly one worker. `suspend` pauses accepting (the supervisor does
/// this before handing listening sockets to a successor process) and
/// `resume` restores it if the handover aborts.
pub struct Listener {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    suspended: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Listener {
    pub fn bind(addr: &SocketAddr, workers: Vec<WorkerRef>)
        -> io::Result<Listener>
    {
        assert!(workers.len() > 0);
        let sock = StdTcpListener::bind(addr)?;
        let addr = sock.local_addr()?;
        sock.set_nonblocking(true)?;
        let running = Arc::new(AtomicBool::new(true));
        let suspended = Arc::new(AtomicBool::new(false));
        let thread = {
            let running = running.clone();
            let suspended = suspended.clone();
            thread::Builder::new().name(format!("accept-{}", addr))
                .spawn(move || {
                    accept_loop(sock, workers, running, suspended);
                })
                .expect("can spawn an accept thread")
        };
        info!("listening on {}", addr);
        Ok(Listener {
            addr: addr,
            running: running,
            suspended: suspended,
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Pause accepting without closing the listening socket
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    /// Stop accepting and close the listening socket
    pub fn close(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

fn accept_loop(sock: StdTcpListener, workers: Vec<WorkerRef>,
    running: Arc<AtomicBool>, suspended: Arc<AtomicBool>)
{
    let mut next = 0;
    while running.load(Ordering::SeqCst) {
        if suspended.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
            continue;
        }
        match sock.accept() {
            Ok((conn, peer)) => {
                // round-robin; a dead worker gives the socket back and
                // the next one gets it
                let mut pending = Some((conn, peer));
                for _ in 0..workers.len() {
                    let worker = &workers[next % workers.len()];
                    next += 1;
                    let (conn, peer) = pending.take()
                        .expect("socket still unassigned");
                    match worker.assign(conn, peer) {
                        Ok(()) => break,
                        Err(back) => pending = Some(back),
                    }
                }
                if let Some((_, peer)) = pending {
                    warn!("no worker accepted connection from {}", peer);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                error!("accept error: {}", e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
