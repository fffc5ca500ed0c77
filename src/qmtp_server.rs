mod queue;

use crate::config::Config;
use crate::qmtp_server::queue::Backend;
use crate::store::Store;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use qmtp::{Abort, AbortKind, PeerInfo, EXIT_RESOURCES};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

fn log_abort(peer: &str, abort: &Abort) {
    match abort.kind() {
        AbortKind::Disconnect => debug!("{}: connection closed", peer),
        AbortKind::ProtocolViolation => warn!("{}: {}", peer, abort),
        AbortKind::Resources => error!("{}: {}", peer, abort),
    }
}

/// Serve one connection on stdin and stdout, as run from a super-server.
///
/// Returns the exit status for the process.
pub fn serve_stdio(config: &Config) -> Result<i32> {
    let store = Store::open(&config.home)?;
    let queue = Backend::new(&config.queue).context("unable to open queue")?;
    watchdog(config.timeout);

    let stdin = io::stdin();
    let stdout = io::stdout();
    let peer = config.peer.remote_ip.as_deref().unwrap_or("unknown");
    let abort = config
        .session_builder()
        .build(queue, store, stdin.lock(), stdout.lock())
        .serve();
    log_abort(peer, &abort);
    Ok(abort.exit_code())
}

// A blocked read cannot see the deadline, so the whole process goes away
fn watchdog(timeout: Duration) {
    thread::spawn(move || {
        thread::sleep(timeout);
        error!("connection time budget of {:?} exhausted", timeout);
        std::process::exit(EXIT_RESOURCES);
    });
}

/// Accept connections on `addr`, serving each one on its own thread.
///
/// At most `max_connections` are served at once; further clients wait in the
/// listen backlog until a slot frees up.
pub fn serve_tcp(config: &Config, addr: &str) -> Result<()> {
    let store = Store::open(&config.home)?;
    // Fail early on a bad spool directory
    Backend::new(&config.queue).context("unable to open queue")?;
    let listener =
        TcpListener::bind(addr).with_context(|| format!("unable to listen on {}", addr))?;
    info!(
        "listening on {}, at most {} connections",
        listener.local_addr()?,
        config.max_connections
    );
    let limit = ConnectionLimit::new(config.max_connections);

    loop {
        let permit = limit.acquire();
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!("error accepting connection: {}", e);
                continue;
            }
        };
        let config = config.clone();
        let store = match store.reopen() {
            Ok(store) => store,
            Err(e) => {
                error!("unable to open domain table: {:#}", e);
                continue;
            }
        };
        thread::spawn(move || {
            let _permit = permit;
            if let Err(e) = handle_client(stream, &config, store) {
                error!("error handling client: {:#}", e);
            }
        });
    }
}

fn handle_client(stream: TcpStream, config: &Config, store: Store) -> Result<()> {
    let remote = stream.peer_addr()?;
    let local = stream.local_addr()?;
    debug!("connection from {}", remote);
    let queue = Backend::new(&config.queue)?;

    let mut builder = config.session_builder();
    builder.peer(PeerInfo {
        local: Some(local.ip().to_string()),
        remote_ip: Some(remote.ip().to_string()),
        remote_host: None,
        remote_info: None,
    });
    let deadline = Instant::now() + config.timeout;
    let reader = TimedStream {
        stream: stream.try_clone()?,
        deadline,
    };
    let writer = TimedStream { stream, deadline };
    let abort = builder.build(queue, store, reader, writer).serve();
    log_abort(&remote.to_string(), &abort);
    Ok(())
}

/// Bounds the number of connections served at once
struct ConnectionLimit {
    open: Mutex<usize>,
    freed: Condvar,
    max: usize,
}

/// A connection slot, given back when dropped
struct Permit(Arc<ConnectionLimit>);

impl ConnectionLimit {
    fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(0),
            freed: Condvar::new(),
            max: max.max(1),
        })
    }

    /// Wait for a free slot
    fn acquire(self: &Arc<Self>) -> Permit {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if *open >= self.max {
            warn!("{} connections open, waiting for one to finish", *open);
        }
        while *open >= self.max {
            open = self.freed.wait(open).unwrap_or_else(PoisonError::into_inner);
        }
        *open += 1;
        Permit(Arc::clone(self))
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut open = self.0.open.lock().unwrap_or_else(PoisonError::into_inner);
        *open -= 1;
        self.0.freed.notify_one();
    }
}

/// Socket that gives up once the connection deadline has passed.
///
/// Every read and write may block for at most what is left of the budget.
struct TimedStream {
    stream: TcpStream,
    deadline: Instant,
}

impl TimedStream {
    fn remaining(&self) -> io::Result<Duration> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connection deadline passed"));
        }
        Ok(remaining)
    }
}

impl Read for TimedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining()?;
        self.stream.set_read_timeout(Some(remaining))?;
        self.stream.read(buf)
    }
}

impl Write for TimedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.remaining()?;
        self.stream.set_write_timeout(Some(remaining))?;
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
