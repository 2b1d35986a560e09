//! In-memory overlay
//!
//! Stands in for the real overlay library: conduits are process-local byte
//! queues the host can inject into and drain, ports are sequential, and
//! disconnect notifications are recorded so tests can assert the
//! fire-and-forget contract.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::overlay::{Conduit, Overlay, OverlayError, PeerKind, TransportKind};

const FIRST_PORT: u16 = 9000;

/// Loopback implementation of [`Overlay`]
pub struct MemoryOverlay {
    conduits: Mutex<HashMap<u16, Arc<MemoryConduit>>>,
    next_port: AtomicU16,
    disconnected_ports: Mutex<Vec<u16>>,
    fail_disconnects: AtomicBool,
}

impl MemoryOverlay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            conduits: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(FIRST_PORT),
            disconnected_ports: Mutex::new(Vec::new()),
            fail_disconnects: AtomicBool::new(false),
        })
    }

    /// Make every disconnect notification fail, for exercising the
    /// best-effort contract.
    pub fn set_fail_disconnects(&self, fail: bool) {
        self.fail_disconnects.store(fail, Ordering::SeqCst);
    }

    /// Ports whose disconnect notification arrived.
    pub fn disconnected_ports(&self) -> Vec<u16> {
        self.disconnected_ports.lock().clone()
    }

    /// Currently open conduits, newest last.
    pub fn open_conduits(&self) -> Vec<Arc<MemoryConduit>> {
        let conduits = self.conduits.lock();
        let mut open: Vec<_> = conduits.values().cloned().collect();
        open.sort_by_key(|conduit| conduit.port());
        open
    }
}

impl Overlay for MemoryOverlay {
    fn create_conduit(
        &self,
        transport: TransportKind,
        peer: PeerKind,
    ) -> Result<Arc<dyn Conduit>, OverlayError> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let conduit = Arc::new(MemoryConduit {
            port,
            transport,
            peer,
            outbound: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            inbound: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.conduits.lock().insert(port, Arc::clone(&conduit));
        debug!(port, %transport, %peer, "conduit created");
        Ok(conduit)
    }

    fn disconnect_port(&self, port: u16) -> Result<(), OverlayError> {
        if self.fail_disconnects.load(Ordering::SeqCst) {
            return Err(OverlayError::DisconnectFailed(format!(
                "port {port} unreachable"
            )));
        }
        self.disconnected_ports.lock().push(port);
        if let Some(conduit) = self.conduits.lock().remove(&port) {
            conduit.close();
        }
        Ok(())
    }

    fn disconnect_all(&self, peer: PeerKind) -> Result<(), OverlayError> {
        if self.fail_disconnects.load(Ordering::SeqCst) {
            return Err(OverlayError::DisconnectFailed("overlay unreachable".into()));
        }
        let mut conduits = self.conduits.lock();
        conduits.retain(|_, conduit| {
            if conduit.peer == peer {
                conduit.close();
                false
            } else {
                true
            }
        });
        Ok(())
    }

    fn peer_count(&self, peer: PeerKind) -> usize {
        self.conduits
            .lock()
            .values()
            .filter(|conduit| conduit.peer == peer && !conduit.is_closed())
            .count()
    }
}

/// Loopback conduit: a pair of byte queues with test accessors
pub struct MemoryConduit {
    port: u16,
    transport: TransportKind,
    peer: PeerKind,
    /// Overlay → peer direction, drained by the bridge's read loop.
    outbound: Mutex<VecDeque<u8>>,
    ready: Condvar,
    /// Peer → overlay direction, filled by the bridge's writes.
    inbound: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryConduit {
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn peer_kind(&self) -> PeerKind {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue bytes for the bridge to carry toward the peer.
    pub fn inject(&self, bytes: &[u8]) {
        self.outbound.lock().extend(bytes.iter().copied());
        self.ready.notify_one();
    }

    /// Bytes the bridge has delivered from the peer so far.
    pub fn received(&self) -> Vec<u8> {
        self.inbound.lock().clone()
    }
}

impl Conduit for MemoryConduit {
    fn port(&self) -> u16 {
        self.port
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, OverlayError> {
        let mut outbound = self.outbound.lock();
        loop {
            if !outbound.is_empty() {
                let n = outbound.len().min(buf.len());
                for (slot, byte) in buf.iter_mut().zip(outbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(OverlayError::Closed);
            }
            self.ready.wait(&mut outbound);
        }
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        self.inbound.lock().extend_from_slice(buf);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // take the lock so a reader between its closed-check and its
            // wait cannot miss the wakeup
            let _outbound = self.outbound.lock();
            self.ready.notify_all();
        }
    }
}
