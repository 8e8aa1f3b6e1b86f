//! In-memory [`EnvChannel`] for driving controllers without sockets.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rlbridge_core::{EnvChannel, TransportError};

#[derive(Debug, Default)]
struct Loopback {
    connected: bool,
    closed: bool,
    fail_sends: usize,
    inbound: VecDeque<String>,
    outbound: Vec<String>,
}

/// Channel whose inbound messages are queued by the test and whose outbound
/// messages are recorded.
///
/// Clones share the same queues, so a test keeps a clone as a probe.
#[derive(Debug, Clone, Default)]
pub struct LoopbackChannel {
    inner: Rc<RefCell<Loopback>>,
}

impl LoopbackChannel {
    /// A channel that reports itself connected.
    pub fn connected() -> Self {
        let channel = Self::default();
        channel.inner.borrow_mut().connected = true;
        channel
    }

    pub fn probe(&self) -> Self {
        self.clone()
    }

    /// Queue one inbound message, returned by a later `receive`.
    pub fn push_inbound(&self, message: impl Into<String>) {
        self.inner.borrow_mut().inbound.push_back(message.into());
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.borrow_mut().connected = connected;
    }

    /// Make the next `count` sends fail with an IO error.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.borrow_mut().fail_sends = count;
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.inner.borrow().outbound.clone()
    }

    /// Everything sent so far, clearing the record.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.borrow_mut().outbound)
    }

    pub fn pending_inbound(&self) -> usize {
        self.inner.borrow().inbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }
}

impl EnvChannel for LoopbackChannel {
    fn is_connected(&self) -> bool {
        let inner = self.inner.borrow();
        inner.connected && !inner.closed
    }

    fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(TransportError::PoolClosed);
        }
        if inner.fail_sends > 0 {
            inner.fail_sends -= 1;
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted send failure",
            )));
        }
        inner.outbound.push(message.to_string());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<String>, TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(TransportError::PoolClosed);
        }
        Ok(inner.inbound.pop_front())
    }

    fn close(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        inner.connected = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
