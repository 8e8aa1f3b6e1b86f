//! A single peer connection.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use rlbridge_core::{Role, TransportError};
use tracing::{debug, trace, warn};

/// Bind a listening socket on `address:port`.
///
/// Port 0 binds an ephemeral port; read it back with `local_addr()`.
pub fn listen(address: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((address, port))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// An open duplex byte stream to one peer, tagged with its role.
///
/// Owned by exactly one socket pool. Closing is idempotent.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    role: Role,
    peer: Option<SocketAddr>,
    open: bool,
}

impl Connection {
    /// Wrap an accepted stream. The stream is switched to blocking mode with
    /// Nagle disabled.
    pub fn new(stream: TcpStream, role: Role) -> Self {
        if let Err(err) = stream.set_nonblocking(false) {
            warn!(%role, "failed to set stream blocking: {err}");
        }
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%role, "failed to set nodelay: {err}");
        }
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            role,
            peer,
            open: true,
        }
    }

    /// Bound every blocking write by `timeout`. A zero timeout is ignored.
    #[must_use]
    pub fn with_write_timeout(self, timeout: Duration) -> Self {
        if let Err(err) = self.stream.set_write_timeout(Some(timeout).filter(|t| !t.is_zero())) {
            warn!(role = %self.role, "failed to set write timeout: {err}");
        }
        self
    }

    /// Connect to a listening bridge. Used on the peer side.
    pub fn connect(address: &str, port: u16, role: Role) -> io::Result<Self> {
        let stream = TcpStream::connect((address, port))?;
        Ok(Self::new(stream, role))
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Write `bytes` in one attempt. Failures are reported, not retried.
    ///
    /// A peer that stops reading makes the write time out. Nothing was sent
    /// on [`TransportError::WriteTimeout`]. After a
    /// [`TransportError::PartialWrite`] the stream holds half a frame, so the
    /// connection is closed.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => {
                    self.close();
                    return Err(TransportError::Closed);
                }
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    if written == 0 {
                        warn!(role = %self.role, peer = ?self.peer, "write timed out");
                        return Err(TransportError::WriteTimeout);
                    }
                    warn!(role = %self.role, written, total = bytes.len(), "partial write, closing");
                    self.close();
                    return Err(TransportError::PartialWrite {
                        written,
                        total: bytes.len(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        trace!(role = %self.role, bytes = bytes.len(), "sent");
        Ok(())
    }

    /// Read whatever is pending, up to `max_bytes`, without blocking.
    ///
    /// Returns an empty buffer when nothing is pending. End of stream closes
    /// the connection and reports [`TransportError::Closed`].
    pub fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let mut buf = vec![0u8; max_bytes.max(1)];
        self.stream.set_nonblocking(true)?;
        let result = self.stream.read(&mut buf);
        if let Err(err) = self.stream.set_nonblocking(false) {
            debug!(role = %self.role, "failed to restore blocking mode: {err}");
        }
        match result {
            Ok(0) => {
                debug!(role = %self.role, peer = ?self.peer, "peer closed the connection");
                self.close();
                Err(TransportError::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                trace!(role = %self.role, bytes = n, "received");
                Ok(buf)
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Shut the stream down. Calling this again does nothing.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            trace!(role = %self.role, "shutdown: {err}");
        }
        debug!(role = %self.role, peer = ?self.peer, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rlbridge_core::EnvId;
    use std::time::{Duration, Instant};

    fn pair() -> (Connection, TcpStream) {
        let listener = listen("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Connection::new(server, Role::Environment(EnvId(0))), client)
    }

    fn receive_within(conn: &mut Connection, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        loop {
            let bytes = conn.receive(64).unwrap();
            if !bytes.is_empty() || Instant::now() > deadline {
                return bytes;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn receive_is_empty_when_nothing_pending() {
        let (mut conn, _client) = pair();
        assert!(conn.receive(64).unwrap().is_empty());
        assert!(conn.is_open());
    }

    #[test]
    fn send_and_receive_bytes() {
        let (mut conn, mut client) = pair();
        client.write_all(b"ACT=1\n").unwrap();
        assert_eq!(receive_within(&mut conn, Duration::from_secs(2)), b"ACT=1\n");

        conn.send(b"OBS=0\n").unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"OBS=0\n");
    }

    #[test]
    fn receive_respects_max_bytes() {
        let (mut conn, mut client) = pair();
        client.write_all(b"0123456789").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.receive(4).unwrap(), b"0123");
    }

    #[test]
    fn eof_closes_connection() {
        let (mut conn, client) = pair();
        drop(client);
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = loop {
            match conn.receive(16) {
                Err(e) => break e,
                Ok(_) if Instant::now() > deadline => panic!("no EOF observed"),
                Ok(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        assert!(matches!(err, TransportError::Closed));
        assert!(!conn.is_open());
        assert!(matches!(conn.send(b"x"), Err(TransportError::Closed)));
    }

    #[test]
    fn send_to_peer_that_never_reads_times_out() {
        let (conn, _client) = pair();
        let mut conn = conn.with_write_timeout(Duration::from_millis(50));
        let chunk = vec![b'x'; 1 << 20];
        let started = Instant::now();
        let err = (0..512)
            .find_map(|_| conn.send(&chunk).err())
            .expect("kernel buffers never filled");
        assert!(matches!(
            err,
            TransportError::WriteTimeout | TransportError::PartialWrite { .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(20));
        if matches!(err, TransportError::PartialWrite { .. }) {
            assert!(!conn.is_open());
        }
    }

    #[test]
    fn close_is_idempotent() {
        let (mut conn, _client) = pair();
        conn.close();
        conn.close();
        assert!(!conn.is_open());
        assert_eq!(conn.role(), Role::Environment(EnvId(0)));
        assert!(conn.peer_addr().is_some());
    }
}
