//! Background accept loop.
//!
//! [`AcceptWorker`] owns the listening socket on its own thread, polls it
//! without blocking and hands every accepted stream to an [`Acceptor`]. The
//! listener is closed when the worker exits.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// What the worker does after handing off a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Keep polling for more connections.
    Continue,
    /// No more connections are wanted; exit and close the listener.
    Stop,
}

/// Receives connections accepted by an [`AcceptWorker`].
///
/// Runs on the worker thread.
pub trait Acceptor: Send + 'static {
    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> AcceptOutcome;
}

// ---------------------------------------------------------------------------
// AcceptWorker
// ---------------------------------------------------------------------------

/// Handle to a running accept thread.
pub struct AcceptWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl AcceptWorker {
    /// Start polling `listener`, sleeping `poll_interval` whenever nothing is
    /// pending.
    pub fn spawn<A: Acceptor>(
        listener: TcpListener,
        acceptor: A,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let span = tracing::Span::current();
        let handle = thread::Builder::new()
            .name("rlbridge-accept".into())
            .spawn(move || {
                span.in_scope(|| run_accept_loop(&listener, &acceptor, &flag, poll_interval));
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
            local_addr,
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the thread to exit after its current poll.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait up to `timeout` for it to exit.
    ///
    /// Returns `false` if the thread did not finish in time; it is then
    /// detached and exits on its own at the next poll.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(listen_addr = %self.local_addr, "accept worker did not stop in time, detaching");
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            warn!(listen_addr = %self.local_addr, "accept worker panicked");
        }
        true
    }
}

impl Drop for AcceptWorker {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn run_accept_loop<A: Acceptor>(
    listener: &TcpListener,
    acceptor: &A,
    stop: &AtomicBool,
    poll_interval: Duration,
) {
    let span = tracing::info_span!("accept_loop", listen_addr = ?listener.local_addr().ok());
    let _guard = span.enter();
    debug!("accept loop started");

    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "incoming connection");
                if acceptor.accept(stream, peer) == AcceptOutcome::Stop {
                    stop.store(true, Ordering::Relaxed);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(poll_interval);
            }
            Err(err) => {
                warn!("accept error: {err}");
                thread::sleep(poll_interval);
            }
        }
    }
    info!("accept loop stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::listen;
    use std::sync::Mutex;

    struct Collect {
        peers: Arc<Mutex<Vec<TcpStream>>>,
        limit: usize,
    }

    impl Acceptor for Collect {
        fn accept(&self, stream: TcpStream, _peer: SocketAddr) -> AcceptOutcome {
            let mut peers = self.peers.lock().unwrap();
            peers.push(stream);
            if peers.len() >= self.limit {
                AcceptOutcome::Stop
            } else {
                AcceptOutcome::Continue
            }
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn hands_connections_to_acceptor_and_stops_when_told() {
        let peers = Arc::new(Mutex::new(Vec::new()));
        let listener = listen("127.0.0.1", 0).unwrap();
        let worker = AcceptWorker::spawn(
            listener,
            Collect {
                peers: Arc::clone(&peers),
                limit: 2,
            },
            Duration::from_millis(5),
        )
        .unwrap();
        let addr = worker.local_addr();

        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();
        assert!(wait_until(Duration::from_secs(2), || peers.lock().unwrap().len() == 2));
        assert!(wait_until(Duration::from_secs(2), || !worker.is_running()));
    }

    #[test]
    fn listener_closes_after_worker_exits() {
        let listener = listen("127.0.0.1", 0).unwrap();
        let mut worker = AcceptWorker::spawn(
            listener,
            Collect {
                peers: Arc::new(Mutex::new(Vec::new())),
                limit: 10,
            },
            Duration::from_millis(5),
        )
        .unwrap();
        let addr = worker.local_addr();
        assert!(worker.shutdown(Duration::from_secs(1)));
        assert!(!worker.is_running());
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn shutdown_twice_is_harmless() {
        let listener = listen("127.0.0.1", 0).unwrap();
        let mut worker = AcceptWorker::spawn(
            listener,
            Collect {
                peers: Arc::new(Mutex::new(Vec::new())),
                limit: 1,
            },
            Duration::from_millis(5),
        )
        .unwrap();
        assert!(worker.shutdown(Duration::from_secs(1)));
        assert!(worker.shutdown(Duration::from_secs(1)));
    }
}
