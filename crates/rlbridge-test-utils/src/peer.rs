//! Blocking TCP client standing in for the training process.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use rlbridge_core::Terminator;

/// Read timeout used by [`TestPeer::recv`].
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A peer connection that writes and reads terminated frames.
pub struct TestPeer {
    stream: TcpStream,
    terminator: Vec<u8>,
    buffer: Vec<u8>,
}

impl TestPeer {
    pub fn connect(addr: SocketAddr, terminator: &Terminator) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            terminator: terminator.as_bytes().to_vec(),
            buffer: Vec::new(),
        })
    }

    /// Send `message` followed by the terminator.
    pub fn send(&mut self, message: &str) -> io::Result<()> {
        self.send_raw(message.as_bytes())?;
        let term = self.terminator.clone();
        self.send_raw(&term)
    }

    /// Send bytes as-is, without a terminator.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Block until one frame arrives, up to [`RECV_TIMEOUT`].
    pub fn recv(&mut self) -> io::Result<String> {
        self.recv_timeout(RECV_TIMEOUT)
    }

    /// Block until one frame arrives or `timeout` passes.
    ///
    /// Returns `UnexpectedEof` if the server closes the connection first.
    pub fn recv_timeout(&mut self, timeout: Duration) -> io::Result<String> {
        self.stream.set_read_timeout(Some(timeout))?;
        loop {
            if let Some(at) = self
                .buffer
                .windows(self.terminator.len())
                .position(|w| w == self.terminator.as_slice())
            {
                let frame = String::from_utf8_lossy(&self.buffer[..at]).into_owned();
                self.buffer.drain(..at + self.terminator.len());
                return Ok(frame);
            }
            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Whether the server has closed this connection, waiting up to `timeout`.
    pub fn is_closed_by_server(&mut self, timeout: Duration) -> bool {
        match self.recv_timeout(timeout) {
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            Ok(_) => false,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}
