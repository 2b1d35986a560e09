//! Duplex bridge — the byte pump between one radio socket and one conduit
//!
//! Two independent copy loops on dedicated threads, no queueing and no
//! buffering beyond one packet-sized scratch buffer per direction. The two
//! loops never share data; they communicate only through resource closure:
//! when either loop exits it closes both resources, which faults the other
//! loop's blocking read and brings it down too.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::overlay::{Conduit, OverlayError};
use crate::transport::api::{ChannelSocket, PeerAddress, TransportError};

type ExitHook = Box<dyn FnOnce() + Send>;

/// The live pairing of one channel socket and one overlay conduit
pub struct DuplexBridge {
    peer: PeerAddress,
    socket: Arc<dyn ChannelSocket>,
    conduit: Arc<dyn Conduit>,
    buffer_size: usize,
    closed: AtomicBool,
    bytes_to_overlay: AtomicU64,
    bytes_to_peer: AtomicU64,
    on_exit: Mutex<Option<ExitHook>>,
}

impl DuplexBridge {
    /// `buffer_size` is the transport's maximum packet size; both copy loops
    /// read at most that much per iteration.
    pub fn new(
        peer: PeerAddress,
        socket: Arc<dyn ChannelSocket>,
        conduit: Arc<dyn Conduit>,
        buffer_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            socket,
            conduit,
            buffer_size: buffer_size.max(1),
            closed: AtomicBool::new(false),
            bytes_to_overlay: AtomicU64::new(0),
            bytes_to_peer: AtomicU64::new(0),
            on_exit: Mutex::new(None),
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn conduit_port(&self) -> u16 {
        self.conduit.port()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bytes carried from the socket into the conduit so far.
    pub fn bytes_to_overlay(&self) -> u64 {
        self.bytes_to_overlay.load(Ordering::Relaxed)
    }

    /// Bytes carried from the conduit into the socket so far.
    pub fn bytes_to_peer(&self) -> u64 {
        self.bytes_to_peer.load(Ordering::Relaxed)
    }

    /// Launch both copy loops and return immediately. `on_exit` runs exactly
    /// once, after the first loop terminates and both resources are closed;
    /// it is the deregistration hook.
    pub fn start(self: Arc<Self>, on_exit: impl FnOnce() + Send + 'static) {
        *self.on_exit.lock() = Some(Box::new(on_exit));

        let inbound = Arc::clone(&self);
        let spawned = std::thread::Builder::new()
            .name(format!("bridge-rx-{}", self.peer))
            .spawn(move || inbound.run_socket_to_conduit());
        if let Err(err) = spawned {
            warn!(peer = %self.peer, %err, "failed to spawn bridge read loop");
            self.finish();
            return;
        }

        let outbound = Arc::clone(&self);
        let spawned = std::thread::Builder::new()
            .name(format!("bridge-tx-{}", self.peer))
            .spawn(move || outbound.run_conduit_to_socket());
        if let Err(err) = spawned {
            warn!(peer = %self.peer, %err, "failed to spawn bridge write loop");
            self.finish();
        }
    }

    /// Close both resources. Idempotent; safe from either loop, the
    /// registry, or the coordinator.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.socket.close();
        self.conduit.close();
        debug!(peer = %self.peer, "bridge closed");
    }

    fn finish(&self) {
        self.close();
        let hook = self.on_exit.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn run_socket_to_conduit(&self) {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let n = match self.socket.read(&mut buf) {
                // no data yet, not end-of-stream
                Ok(0) => continue,
                Ok(n) => n,
                Err(TransportError::Closed) => break,
                Err(err) => {
                    debug!(peer = %self.peer, %err, "socket read fault");
                    break;
                }
            };
            if let Err(err) = self.conduit.write_all(&buf[..n]) {
                debug!(peer = %self.peer, %err, "conduit write fault");
                break;
            }
            self.bytes_to_overlay.fetch_add(n as u64, Ordering::Relaxed);
        }
        self.finish();
    }

    fn run_conduit_to_socket(&self) {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let n = match self.conduit.read(&mut buf) {
                // no data yet, not end-of-stream
                Ok(0) => continue,
                Ok(n) => n,
                Err(OverlayError::Closed) => break,
                Err(err) => {
                    debug!(peer = %self.peer, %err, "conduit read fault");
                    break;
                }
            };
            if let Err(err) = self.socket.write_all(&buf[..n]) {
                debug!(peer = %self.peer, %err, "socket write fault");
                break;
            }
            self.bytes_to_peer.fetch_add(n as u64, Ordering::Relaxed);
        }
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{MemoryOverlay, Overlay, PeerKind, TransportKind};
    use crate::transport::api::RadioAdapter;
    use crate::transport::memory::MemoryHub;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Dial A→B and bridge the accepted end into a fresh loopback conduit.
    fn bridged_pair() -> (
        Arc<dyn ChannelSocket>,
        Arc<crate::overlay::MemoryConduit>,
        Arc<DuplexBridge>,
    ) {
        let hub = MemoryHub::new();
        let a = hub.create_adapter("AA:01");
        let b = hub.create_adapter("AA:02");

        let listener = b.listen_channel().expect("Listen");
        let dialed = a
            .dial_channel(b.address(), listener.handle())
            .expect("Dial");
        let accepted = listener.accept().expect("Accept");

        let overlay = MemoryOverlay::new();
        overlay
            .create_conduit(TransportKind::Local, PeerKind::Nearby)
            .expect("Create conduit");
        let conduit = overlay.open_conduits().remove(0);

        let bridge = DuplexBridge::new(
            accepted.peer_address(),
            accepted,
            Arc::clone(&conduit) as Arc<dyn Conduit>,
            64,
        );
        (dialed, conduit, bridge)
    }

    #[test]
    fn test_socket_bytes_reach_conduit() {
        let (dialed, conduit, bridge) = bridged_pair();
        Arc::clone(&bridge).start(|| {});

        dialed.write_all(b"over the air").expect("Write");
        assert!(wait_until(Duration::from_secs(1), || conduit.received()
            == b"over the air"));
        assert!(wait_until(Duration::from_secs(1), || bridge.bytes_to_overlay()
            == 12));
    }

    #[test]
    fn test_conduit_bytes_reach_socket() {
        let (dialed, conduit, bridge) = bridged_pair();
        Arc::clone(&bridge).start(|| {});

        conduit.inject(b"from the overlay");
        let mut buf = [0u8; 64];
        let n = dialed.read(&mut buf).expect("Read");
        assert_eq!(&buf[..n], b"from the overlay");
        assert!(wait_until(Duration::from_secs(1), || bridge.bytes_to_peer()
            == 16));
    }

    #[test]
    fn test_payload_larger_than_buffer_is_relayed_whole() {
        let (dialed, conduit, bridge) = bridged_pair();
        Arc::clone(&bridge).start(|| {});

        let payload: Vec<u8> = (0..=255).cycle().take(1000).map(|b: u16| b as u8).collect();
        dialed.write_all(&payload).expect("Write");
        assert!(wait_until(Duration::from_secs(1), || conduit.received().len()
            == payload.len()));
        assert_eq!(conduit.received(), payload);
    }

    #[test]
    fn test_socket_close_tears_down_both_loops() {
        let (dialed, conduit, bridge) = bridged_pair();
        Arc::clone(&bridge).start(|| {});

        dialed.close();
        assert!(wait_until(Duration::from_secs(1), || bridge.is_closed()));
        assert!(wait_until(Duration::from_secs(1), || conduit.is_closed()));
    }

    #[test]
    fn test_conduit_close_tears_down_both_loops() {
        let (dialed, conduit, bridge) = bridged_pair();
        Arc::clone(&bridge).start(|| {});

        conduit.close();
        assert!(wait_until(Duration::from_secs(1), || bridge.is_closed()));
        let mut buf = [0u8; 8];
        assert!(wait_until(Duration::from_secs(1), || dialed
            .read(&mut buf)
            .is_err()));
    }

    #[test]
    fn test_exit_hook_runs_exactly_once() {
        let (dialed, _conduit, bridge) = bridged_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = Arc::clone(&fired);
        Arc::clone(&bridge).start(move || {
            hook_fired.fetch_add(1, Ordering::SeqCst);
        });

        dialed.close();
        assert!(wait_until(Duration::from_secs(1), || fired
            .load(Ordering::SeqCst)
            == 1));
        // both loops have exited by now; the count must not move again
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_dialed, conduit, bridge) = bridged_pair();
        Arc::clone(&bridge).start(|| {});

        bridge.close();
        bridge.close();
        assert!(bridge.is_closed());
        assert!(conduit.is_closed());
    }

    #[test]
    fn test_close_before_start_still_runs_hook() {
        let (_dialed, _conduit, bridge) = bridged_pair();
        bridge.close();

        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = Arc::clone(&fired);
        Arc::clone(&bridge).start(move || {
            hook_fired.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(1), || fired
            .load(Ordering::SeqCst)
            == 1));
    }
}
