//! Slot table and accept routine shared by the single and multi pools.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rlbridge_core::{BridgeConfig, BridgeError, EnvId, Role, TransportError};
use rlbridge_wire::FrameBuffer;
use rlbridge_wire::framing::frame;
use rlbridge_wire::protocol::Handshake;
use tracing::{debug, info, warn};

use crate::accept::{AcceptOutcome, AcceptWorker, Acceptor};
use crate::connection::{Connection, listen};

/// Lifecycle of a socket pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Not listening (never started, or closed).
    Unbound,
    /// Listening, no admin yet.
    Listening,
    /// Admin connected, environment slots not all filled.
    AdminConnected,
    /// Admin and every environment slot connected.
    Ready,
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// Connections and partial-frame buffers, shared with the accept thread.
#[derive(Debug)]
pub(crate) struct Slots {
    pub(crate) admin: Option<Connection>,
    pub(crate) admin_buffer: FrameBuffer,
    pub(crate) envs: Vec<Option<Connection>>,
    pub(crate) buffers: Vec<FrameBuffer>,
    pub(crate) closing: bool,
}

impl Slots {
    fn new(config: &BridgeConfig) -> Self {
        Self {
            admin: None,
            admin_buffer: FrameBuffer::with_limit(&config.terminator, config.max_frame_bytes),
            envs: std::iter::repeat_with(|| None).take(config.num_envs).collect(),
            buffers: (0..config.num_envs)
                .map(|_| FrameBuffer::with_limit(&config.terminator, config.max_frame_bytes))
                .collect(),
            closing: false,
        }
    }

    fn first_free(&self) -> Option<usize> {
        self.envs.iter().position(Option::is_none)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.admin.as_ref().is_some_and(Connection::is_open)
            && self
                .envs
                .iter()
                .all(|slot| slot.as_ref().is_some_and(Connection::is_open))
    }

    fn close_all(&mut self) {
        if let Some(admin) = self.admin.as_mut() {
            admin.close();
        }
        self.admin = None;
        self.admin_buffer.clear();
        for slot in &mut self.envs {
            if let Some(conn) = slot.as_mut() {
                conn.close();
            }
            *slot = None;
        }
        for buffer in &mut self.buffers {
            buffer.clear();
        }
    }
}

pub(crate) type SharedSlots = Arc<Mutex<Slots>>;

pub(crate) fn lock(slots: &SharedSlots) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock for a read or write; fails once the pool has been closed.
fn lock_open(slots: &SharedSlots) -> Result<MutexGuard<'_, Slots>, TransportError> {
    let guard = lock(slots);
    if guard.closing {
        return Err(TransportError::PoolClosed);
    }
    Ok(guard)
}

// ---------------------------------------------------------------------------
// SlotAcceptor
// ---------------------------------------------------------------------------

/// First connection becomes admin and gets the handshake; the rest fill the
/// first empty environment slot.
struct SlotAcceptor {
    slots: SharedSlots,
    handshake: Vec<u8>,
    write_timeout: Duration,
}

fn reject(stream: &TcpStream, peer: SocketAddr, reason: &str) {
    info!(%peer, reason, "rejecting connection");
    if let Err(err) = stream.shutdown(std::net::Shutdown::Both) {
        debug!(%peer, "shutdown of rejected socket: {err}");
    }
}

impl Acceptor for SlotAcceptor {
    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> AcceptOutcome {
        let mut slots = lock(&self.slots);
        if slots.closing {
            reject(&stream, peer, "pool is closing");
            return AcceptOutcome::Stop;
        }

        if slots.admin.is_none() {
            let mut admin =
                Connection::new(stream, Role::Admin).with_write_timeout(self.write_timeout);
            match admin.send(&self.handshake) {
                Ok(()) => info!(%peer, "admin connected, handshake sent"),
                Err(err) => warn!(%peer, "admin connected, handshake failed: {err}"),
            }
            slots.admin = Some(admin);
            return AcceptOutcome::Continue;
        }

        let Some(index) = slots.first_free() else {
            reject(&stream, peer, "all environment slots are taken");
            return AcceptOutcome::Stop;
        };
        let env = EnvId(index);
        slots.envs[index] = Some(
            Connection::new(stream, Role::Environment(env)).with_write_timeout(self.write_timeout),
        );
        slots.buffers[index].clear();
        info!(%peer, env_id = %env, "environment connected");

        if slots.first_free().is_none() {
            info!(slots = slots.envs.len(), "all environment slots filled, stopping accept");
            AcceptOutcome::Stop
        } else {
            AcceptOutcome::Continue
        }
    }
}

// ---------------------------------------------------------------------------
// PoolCore
// ---------------------------------------------------------------------------

/// Listener lifecycle plus framed reads and writes over the slot table.
pub(crate) struct PoolCore {
    pub(crate) config: BridgeConfig,
    pub(crate) slots: SharedSlots,
    handshake: Handshake,
    worker: Option<AcceptWorker>,
}

impl PoolCore {
    pub(crate) fn new(config: BridgeConfig, handshake: Handshake) -> Self {
        let slots = Arc::new(Mutex::new(Slots::new(&config)));
        Self {
            config,
            slots,
            handshake,
            worker: None,
        }
    }

    pub(crate) const fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Validate the configuration, bind the listener and start accepting.
    pub(crate) fn start(&mut self) -> Result<SocketAddr, BridgeError> {
        self.config.validate()?;
        self.close();
        *lock(&self.slots) = Slots::new(&self.config);

        let listener =
            listen(&self.config.address, self.config.port).map_err(TransportError::from)?;
        let acceptor = SlotAcceptor {
            slots: Arc::clone(&self.slots),
            handshake: frame(&self.handshake.to_string(), &self.config.terminator),
            write_timeout: self.config.write_timeout(),
        };
        let worker = AcceptWorker::spawn(listener, acceptor, self.config.accept_poll_interval())
            .map_err(TransportError::from)?;
        let addr = worker.local_addr();
        info!(listen_addr = %addr, envs = self.config.num_envs, "listening");
        self.worker = Some(worker);
        Ok(addr)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(AcceptWorker::local_addr)
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.worker.as_ref().is_some_and(AcceptWorker::is_running)
    }

    pub(crate) fn state(&self) -> PoolState {
        if self.worker.is_none() {
            return PoolState::Unbound;
        }
        let slots = lock(&self.slots);
        if slots.is_connected() {
            PoolState::Ready
        } else if slots.admin.is_some() {
            PoolState::AdminConnected
        } else {
            PoolState::Listening
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.worker.is_some() && lock(&self.slots).is_connected()
    }

    pub(crate) fn connected_envs(&self) -> usize {
        lock(&self.slots)
            .envs
            .iter()
            .filter(|slot| slot.as_ref().is_some_and(Connection::is_open))
            .count()
    }

    /// Poll until every connection is in, or `timeout` passes.
    pub(crate) fn wait_until_connected(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(poll);
        }
    }

    pub(crate) fn send_admin(&self, message: &str) -> Result<(), TransportError> {
        let mut slots = lock_open(&self.slots)?;
        let admin = slots
            .admin
            .as_mut()
            .ok_or(TransportError::NotConnected("admin"))?;
        admin.send(&frame(message, &self.config.terminator))
    }

    pub(crate) fn receive_admin(&self) -> Result<Option<String>, TransportError> {
        let mut guard = lock_open(&self.slots)?;
        let slots = &mut *guard;
        let admin = slots
            .admin
            .as_mut()
            .ok_or(TransportError::NotConnected("admin"))?;
        read_one(admin, &mut slots.admin_buffer, self.config.recv_buffer_size)
    }

    /// Write already framed bytes to environment slot `env`.
    pub(crate) fn write_env(&self, env: EnvId, bytes: &[u8]) -> Result<(), TransportError> {
        let mut slots = lock_open(&self.slots)?;
        let conn = slots
            .envs
            .get_mut(env.index())
            .and_then(Option::as_mut)
            .ok_or(TransportError::UnknownEnvironment(env.index()))?;
        conn.send(bytes)
    }

    /// Read slot `env` once and return the earliest complete frame.
    pub(crate) fn receive_env_one(&self, env: EnvId) -> Result<Option<String>, TransportError> {
        let mut guard = lock_open(&self.slots)?;
        let slots = &mut *guard;
        let conn = slots
            .envs
            .get_mut(env.index())
            .and_then(Option::as_mut)
            .ok_or(TransportError::UnknownEnvironment(env.index()))?;
        let buffer = &mut slots.buffers[env.index()];
        read_one(conn, buffer, self.config.recv_buffer_size)
    }

    /// Read every filled slot once and collect its complete frames.
    ///
    /// A failing slot is logged and skipped.
    pub(crate) fn receive_env_all(&self) -> Vec<(EnvId, String)> {
        let mut guard = lock(&self.slots);
        let slots = &mut *guard;
        let mut frames = Vec::new();
        for (index, (slot, buffer)) in slots.envs.iter_mut().zip(&mut slots.buffers).enumerate() {
            let Some(conn) = slot.as_mut().filter(|c| c.is_open()) else {
                continue;
            };
            let env = EnvId(index);
            let pushed = conn
                .receive(self.config.recv_buffer_size)
                .and_then(|bytes| buffer.push(&bytes));
            if let Err(err) = pushed {
                warn!(env_id = %env, "receive failed: {err}");
            }
            frames.extend(
                buffer
                    .drain_frames()
                    .into_iter()
                    .filter_map(non_blank)
                    .map(|f| (env, f)),
            );
        }
        frames
    }

    /// Stop accepting and close every connection.
    pub(crate) fn close(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        {
            let mut slots = lock(&self.slots);
            slots.closing = true;
            slots.close_all();
        }
        if !worker.shutdown(self.config.join_timeout()) {
            warn!("accept worker detached");
        }
        info!(listen_addr = %worker.local_addr(), "pool closed");
    }
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Earliest complete frame, reading at most once.
///
/// Frames already buffered are returned before the connection is touched, so
/// everything a peer sent before closing is delivered before `Closed`.
fn read_one(
    conn: &mut Connection,
    buffer: &mut FrameBuffer,
    max_bytes: usize,
) -> Result<Option<String>, TransportError> {
    if let Some(frame) = next_non_blank(buffer) {
        return Ok(Some(frame));
    }
    let bytes = conn.receive(max_bytes)?;
    buffer.push(&bytes)?;
    Ok(next_non_blank(buffer))
}

fn next_non_blank(buffer: &mut FrameBuffer) -> Option<String> {
    std::iter::from_fn(|| buffer.next_frame()).find_map(non_blank)
}

fn non_blank(frame: String) -> Option<String> {
    let trimmed = frame.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == frame.len() {
        Some(frame)
    } else {
        Some(trimmed.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;

    use super::*;

    /// Server half, its peer address and the client half of one connection.
    fn accepted(listener: &TcpListener) -> (TcpStream, SocketAddr, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (server, peer, client)
    }

    fn acceptor(num_envs: usize) -> SlotAcceptor {
        let config = BridgeConfig {
            num_envs,
            ..BridgeConfig::default()
        };
        SlotAcceptor {
            slots: Arc::new(Mutex::new(Slots::new(&config))),
            handshake: b"CONFIG:OBS=1;ACT=1;ENV_TYPE=SINGLE\n".to_vec(),
            write_timeout: config.write_timeout(),
        }
    }

    fn read_to_eof(client: &mut TcpStream) -> Vec<u8> {
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut bytes = Vec::new();
        client.read_to_end(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn roles_follow_acceptance_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let acceptor = acceptor(2);

        let (server, peer, _admin) = accepted(&listener);
        assert_eq!(acceptor.accept(server, peer), AcceptOutcome::Continue);
        let (server, peer, _first) = accepted(&listener);
        assert_eq!(acceptor.accept(server, peer), AcceptOutcome::Continue);
        let (server, peer, _second) = accepted(&listener);
        assert_eq!(acceptor.accept(server, peer), AcceptOutcome::Stop);

        let slots = lock(&acceptor.slots);
        assert_eq!(slots.admin.as_ref().map(Connection::role), Some(Role::Admin));
        assert_eq!(
            slots.envs[1].as_ref().map(Connection::role),
            Some(Role::Environment(EnvId(1)))
        );
        assert!(slots.is_connected());
    }

    #[test]
    fn connection_arriving_while_closing_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let acceptor = acceptor(1);
        lock(&acceptor.slots).closing = true;

        let (server, peer, mut client) = accepted(&listener);
        assert_eq!(acceptor.accept(server, peer), AcceptOutcome::Stop);
        assert!(lock(&acceptor.slots).admin.is_none());
        // Closed without a handshake.
        assert!(read_to_eof(&mut client).is_empty());
    }

    #[test]
    fn connection_beyond_capacity_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let acceptor = acceptor(1);
        let (server, peer, mut admin) = accepted(&listener);
        acceptor.accept(server, peer);
        let (server, peer, _env) = accepted(&listener);
        acceptor.accept(server, peer);

        let (server, peer, mut extra) = accepted(&listener);
        assert_eq!(acceptor.accept(server, peer), AcceptOutcome::Stop);
        assert!(read_to_eof(&mut extra).is_empty());

        let mut handshake = [0u8; 35];
        admin.read_exact(&mut handshake).unwrap();
        assert_eq!(&handshake, b"CONFIG:OBS=1;ACT=1;ENV_TYPE=SINGLE\n");
    }

    #[test]
    fn buffered_frames_are_returned_without_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (server, _, client) = accepted(&listener);
        let mut conn = Connection::new(server, Role::Environment(EnvId(0)));
        let mut buffer = FrameBuffer::new(&rlbridge_core::Terminator::Newline);
        buffer.push(b"ACT=1\n \nACT=2\n").unwrap();
        conn.close();
        drop(client);

        assert_eq!(read_one(&mut conn, &mut buffer, 64).unwrap().as_deref(), Some("ACT=1"));
        assert_eq!(read_one(&mut conn, &mut buffer, 64).unwrap().as_deref(), Some("ACT=2"));
        assert!(matches!(
            read_one(&mut conn, &mut buffer, 64),
            Err(TransportError::Closed)
        ));
    }
}
