extern crate env_logger;
#[macro_use] extern crate log;
extern crate tk_gateway;

use std::env;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use tk_gateway::{Listener, Status, Worker};
use tk_gateway::director::{Backend, BackendAddr, Director};
use tk_gateway::io::BufferSource;
use tk_gateway::runtime::{FnHandler, Handler, Outcome};
use tk_gateway::server::{Config, Request};

const USAGE: &'static str = "\
Usage: gatewayd [options]

Options:
  --listen ADDR         Address to listen on (default 0.0.0.0:8080)
  --backend NAME=ADDR   Add an upstream backend (may be repeated);
                        requests are proxied when any backend is given
  --capacity N          Per-backend capacity (default 16)
  --workers N           Number of worker threads (default 4)
";

fn parse_args() -> Result<(String, Vec<(String, String)>, usize, usize),
                          String>
{
    let mut listen = "0.0.0.0:8080".to_string();
    let mut backends = Vec::new();
    let mut capacity = 16;
    let mut workers = 4;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let value = |args: &mut Iterator<Item=String>| {
            args.next().ok_or_else(|| format!("{} needs a value", arg))
        };
        match &arg[..] {
            "--listen" => listen = value(&mut args)?,
            "--backend" => {
                let pair = value(&mut args)?;
                let mut parts = pair.splitn(2, '=');
                match (parts.next(), parts.next()) {
                    (Some(name), Some(addr)) => {
                        backends.push((name.to_string(), addr.to_string()));
                    }
                    _ => return Err(
                        "--backend needs NAME=ADDR".to_string()),
                }
            }
            "--capacity" => {
                capacity = value(&mut args)?.parse()
                    .map_err(|_| "--capacity needs a number".to_string())?;
            }
            "--workers" => {
                workers = value(&mut args)?.parse()
                    .map_err(|_| "--workers needs a number".to_string())?;
            }
            "--help" | "-h" => {
                print!("{}", USAGE);
                exit(0);
            }
            other => return Err(format!("unknown option {:?}", other)),
        }
    }
    Ok((listen, backends, capacity, workers))
}

fn main() {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    env_logger::init().expect("init logging");

    let (listen, backend_list, capacity, nworkers) = match parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("gatewayd: {}", e);
            eprint!("{}", USAGE);
            exit(2);
        }
    };
    let listen = match listen.parse() {
        Ok(addr) => addr,
        Err(..) => {
            eprintln!("gatewayd: can't parse listen address {:?}", listen);
            exit(2);
        }
    };

    let handler: Arc<Handler> = if backend_list.is_empty() {
        Arc::new(FnHandler::new(|req: &mut Request| {
            req.set_status(Status::Ok);
            let body = b"tk-gateway is running\n";
            req.push_response_header("Content-Length",
                format!("{}", body.len()).into_bytes());
            req.write(BufferSource::copy(body));
            req.finish();
            Outcome::Done
        }))
    } else {
        let mut director = Director::new();
        for &(ref name, ref addr) in backend_list.iter() {
            let addr = match addr.parse() {
                Ok(addr) => addr,
                Err(..) => {
                    eprintln!("gatewayd: can't parse backend address {:?}",
                        addr);
                    exit(2);
                }
            };
            director.add_backend(
                Backend::new(&name[..], BackendAddr::Tcp(addr), capacity));
        }
        let director = director.done();
        Arc::new(FnHandler::new(move |req: &mut Request| {
            req.forward(&director);
            Outcome::Pending
        }))
    };

    handler.setup();

    let cfg = Config::new().done();
    let workers: Vec<_> = (0..nworkers)
        .map(|n| Worker::new(&format!("worker-{}", n), &cfg, &handler))
        .collect();
    let handles = workers.iter().map(|w| w.handle()).collect();

    let listener = match Listener::bind(&listen, handles) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("gatewayd: can't listen on {}: {}", listen, e);
            exit(1);
        }
    };
    info!("gatewayd serving on {} with {} workers",
        listener.addr(), nworkers);

    // graceful shutdown on ctrl-c is the supervisor's job; standalone we
    // just serve until killed
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
