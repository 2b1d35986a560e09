//! Connection registry — the single source of truth for per-peer lifecycle
//!
//! One mutex guards the whole {state, generation, bridge} triple per
//! address, so admission, promotion, and release for the same address never
//! interleave. Scan callbacks, the accept loop, and every bridge's own
//! teardown path all race into this map; the per-attempt generation number
//! keeps a late or stale caller from touching a slot it no longer owns.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::bridge::DuplexBridge;
use crate::overlay::Overlay;
use crate::transport::api::PeerAddress;

/// Per-peer connection state; absence of a slot means Idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Negotiation or inbound setup in flight
    Connecting,
    /// A bridge is running
    Bridging,
}

/// Errors for registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer {0} has no connection attempt in flight")]
    NotConnecting(PeerAddress),

    #[error("Stale attempt for peer {0}")]
    StaleAttempt(PeerAddress),
}

/// Admission token for one connection attempt.
///
/// Carries the attempt's generation; promotion and release through a ticket
/// only act on the slot that attempt still owns.
#[derive(Debug, Clone)]
pub struct ConnectTicket {
    address: PeerAddress,
    generation: u64,
}

impl ConnectTicket {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

struct PeerSlot {
    state: LinkState,
    generation: u64,
    bridge: Option<Arc<DuplexBridge>>,
}

/// The authoritative map from peer address to connection state
pub struct ConnectionRegistry {
    overlay: Arc<dyn Overlay>,
    slots: Mutex<HashMap<PeerAddress, PeerSlot>>,
    next_generation: AtomicU64,
    released_bytes_to_overlay: AtomicU64,
    released_bytes_to_peer: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self {
            overlay,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            released_bytes_to_overlay: AtomicU64::new(0),
            released_bytes_to_peer: AtomicU64::new(0),
        }
    }

    /// Admit a connection attempt for an Idle address. Returns `None` when
    /// the address is already Connecting or Bridging; the caller must then
    /// ignore the discovery event.
    pub fn try_begin_connecting(&self, address: &PeerAddress) -> Option<ConnectTicket> {
        let mut slots = self.slots.lock();
        if slots.contains_key(address) {
            return None;
        }
        let ticket = self.insert_connecting(&mut slots, address);
        debug!(peer = %address, "connection attempt admitted");
        Some(ticket)
    }

    /// Inbound-accept admission. Like [`try_begin_connecting`], but a
    /// Bridging slot whose bridge is already closed is treated as stale and
    /// replaced: an inbound peer reconnecting implies its previous session
    /// is gone.
    ///
    /// [`try_begin_connecting`]: Self::try_begin_connecting
    pub fn admit_inbound(&self, address: &PeerAddress) -> Option<ConnectTicket> {
        let (ticket, stale) = {
            let mut slots = self.slots.lock();
            let replace = match slots.get(address) {
                None => false,
                Some(slot) => {
                    let dead = slot.state == LinkState::Bridging
                        && slot.bridge.as_ref().is_some_and(|b| b.is_closed());
                    if !dead {
                        return None;
                    }
                    true
                }
            };
            let stale = if replace { slots.remove(address) } else { None };
            (self.insert_connecting(&mut slots, address), stale)
        };
        if let Some(slot) = stale {
            info!(peer = %address, "replacing stale bridge with inbound reconnect");
            self.cleanup_slot(address, slot);
        }
        debug!(peer = %address, "inbound connection admitted");
        Some(ticket)
    }

    /// Record the bridge for an attempt that reached the socket stage. Fails
    /// when the slot was released or re-admitted since the ticket was
    /// issued; the caller must then discard the orphan bridge.
    pub fn promote_to_bridging(
        &self,
        ticket: &ConnectTicket,
        bridge: Arc<DuplexBridge>,
    ) -> Result<(), RegistryError> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&ticket.address) {
            Some(slot)
                if slot.generation == ticket.generation && slot.state == LinkState::Connecting =>
            {
                slot.state = LinkState::Bridging;
                slot.bridge = Some(bridge);
                debug!(peer = %ticket.address, "promoted to bridging");
                Ok(())
            }
            Some(_) => Err(RegistryError::StaleAttempt(ticket.address.clone())),
            None => Err(RegistryError::NotConnecting(ticket.address.clone())),
        }
    }

    /// Abort an attempt that has not been promoted. Releases the slot only
    /// while it is still Connecting under the ticket's generation, so a slot
    /// re-admitted after a forced release is left alone. Returns whether the
    /// slot was released.
    pub fn abort_attempt(&self, ticket: &ConnectTicket) -> bool {
        let slot = {
            let mut slots = self.slots.lock();
            let owned = slots.get(&ticket.address).is_some_and(|slot| {
                slot.generation == ticket.generation && slot.state == LinkState::Connecting
            });
            if !owned {
                return false;
            }
            slots.remove(&ticket.address)
        };
        if let Some(slot) = slot {
            debug!(peer = %ticket.address, "connection attempt aborted");
            self.cleanup_slot(&ticket.address, slot);
        }
        true
    }

    /// Release the slot belonging to this ticket's attempt, whatever state
    /// it reached. A bridge's exit hook uses this so that a replacement
    /// attempt admitted in the meantime survives the old bridge's teardown.
    pub fn release_ticket(&self, ticket: &ConnectTicket) {
        let slot = {
            let mut slots = self.slots.lock();
            let owned = slots
                .get(&ticket.address)
                .is_some_and(|slot| slot.generation == ticket.generation);
            if !owned {
                return;
            }
            slots.remove(&ticket.address)
        };
        if let Some(slot) = slot {
            debug!(peer = %ticket.address, "released");
            self.cleanup_slot(&ticket.address, slot);
        }
    }

    /// Forced release of whatever the address currently holds. Idempotent.
    pub fn release(&self, address: &PeerAddress) {
        let slot = self.slots.lock().remove(address);
        if let Some(slot) = slot {
            debug!(peer = %address, "released");
            self.cleanup_slot(address, slot);
        }
    }

    /// Release every address. Used on engine stop and restart.
    pub fn release_all(&self) {
        let drained: Vec<(PeerAddress, PeerSlot)> = {
            let mut slots = self.slots.lock();
            slots.drain().collect()
        };
        for (address, slot) in drained {
            self.cleanup_slot(&address, slot);
        }
    }

    pub fn is_active(&self, address: &PeerAddress) -> bool {
        self.slots.lock().contains_key(address)
    }

    pub fn state_of(&self, address: &PeerAddress) -> Option<LinkState> {
        self.slots.lock().get(address).map(|slot| slot.state)
    }

    pub fn bridge_of(&self, address: &PeerAddress) -> Option<Arc<DuplexBridge>> {
        self.slots
            .lock()
            .get(address)
            .and_then(|slot| slot.bridge.clone())
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Total bytes relayed, live bridges included.
    pub fn traffic_totals(&self) -> (u64, u64) {
        let mut to_overlay = self.released_bytes_to_overlay.load(Ordering::Relaxed);
        let mut to_peer = self.released_bytes_to_peer.load(Ordering::Relaxed);
        for slot in self.slots.lock().values() {
            if let Some(bridge) = &slot.bridge {
                to_overlay += bridge.bytes_to_overlay();
                to_peer += bridge.bytes_to_peer();
            }
        }
        (to_overlay, to_peer)
    }

    fn insert_connecting(
        &self,
        slots: &mut HashMap<PeerAddress, PeerSlot>,
        address: &PeerAddress,
    ) -> ConnectTicket {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            address.clone(),
            PeerSlot {
                state: LinkState::Connecting,
                generation,
                bridge: None,
            },
        );
        ConnectTicket {
            address: address.clone(),
            generation,
        }
    }

    /// Runs outside the map lock: closing resources never blocks admission
    /// of other addresses.
    fn cleanup_slot(&self, address: &PeerAddress, slot: PeerSlot) {
        if let Some(bridge) = slot.bridge {
            bridge.close();
            self.released_bytes_to_overlay
                .fetch_add(bridge.bytes_to_overlay(), Ordering::Relaxed);
            self.released_bytes_to_peer
                .fetch_add(bridge.bytes_to_peer(), Ordering::Relaxed);
            let port = bridge.conduit_port();
            if let Err(err) = self.overlay.disconnect_port(port) {
                debug!(peer = %address, port, %err, "overlay disconnect notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{
        Conduit, MemoryOverlay, MockOverlay, Overlay, OverlayError, PeerKind, TransportKind,
    };
    use crate::transport::api::{ChannelSocket, RadioAdapter, TransportError};
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;

    /// Minimal closable socket; reads block-free by reporting closure.
    struct FakeSocket {
        closed: AtomicBool,
    }

    impl FakeSocket {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
            })
        }
    }

    impl ChannelSocket for FakeSocket {
        fn peer_address(&self) -> PeerAddress {
            PeerAddress::from("FA:KE")
        }

        fn read(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            Err(TransportError::Closed)
        }

        fn write_all(&self, _buf: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConduit {
        port: u16,
        closed: AtomicBool,
    }

    impl FakeConduit {
        fn new(port: u16) -> Arc<Self> {
            Arc::new(Self {
                port,
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Conduit for FakeConduit {
        fn port(&self) -> u16 {
            self.port
        }

        fn read(&self, _buf: &mut [u8]) -> Result<usize, OverlayError> {
            Err(OverlayError::Closed)
        }

        fn write_all(&self, _buf: &[u8]) -> Result<(), OverlayError> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn unstarted_bridge(address: &PeerAddress, port: u16) -> Arc<DuplexBridge> {
        DuplexBridge::new(address.clone(), FakeSocket::new(), FakeConduit::new(port), 64)
    }

    fn registry() -> (ConnectionRegistry, Arc<MemoryOverlay>) {
        let overlay = MemoryOverlay::new();
        let registry = ConnectionRegistry::new(Arc::clone(&overlay) as Arc<dyn Overlay>);
        (registry, overlay)
    }

    #[test]
    fn test_admission_is_exclusive() {
        let (registry, _overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let ticket = registry.try_begin_connecting(&address);
        assert!(ticket.is_some());
        assert_eq!(registry.state_of(&address), Some(LinkState::Connecting));

        assert!(registry.try_begin_connecting(&address).is_none());
    }

    #[test]
    fn test_concurrent_admission_succeeds_exactly_once() {
        let (registry, _overlay) = registry();
        let registry = Arc::new(registry);
        let address = PeerAddress::from("AA:BB");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let address = address.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.try_begin_connecting(&address).is_some()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().expect("Thread"))
            .filter(|&admitted| admitted)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_promote_then_release_returns_to_idle() {
        let (registry, overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let ticket = registry.try_begin_connecting(&address).expect("Admit");
        let bridge = unstarted_bridge(&address, 9100);
        registry
            .promote_to_bridging(&ticket, Arc::clone(&bridge))
            .expect("Promote");
        assert_eq!(registry.state_of(&address), Some(LinkState::Bridging));
        assert!(registry.bridge_of(&address).is_some());

        registry.release(&address);
        assert!(!registry.is_active(&address));
        assert!(bridge.is_closed());
        assert_eq!(overlay.disconnected_ports(), vec![9100]);

        // a later discovery event for the same address is admitted again
        assert!(registry.try_begin_connecting(&address).is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let (registry, overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let ticket = registry.try_begin_connecting(&address).expect("Admit");
        registry
            .promote_to_bridging(&ticket, unstarted_bridge(&address, 9100))
            .expect("Promote");

        registry.release(&address);
        registry.release(&address);
        assert!(!registry.is_active(&address));
        assert_eq!(overlay.disconnected_ports(), vec![9100]);
    }

    #[test]
    fn test_promote_after_release_fails() {
        let (registry, _overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let ticket = registry.try_begin_connecting(&address).expect("Admit");
        registry.release(&address);

        let result = registry.promote_to_bridging(&ticket, unstarted_bridge(&address, 9100));
        assert_eq!(result, Err(RegistryError::NotConnecting(address)));
    }

    #[test]
    fn test_promote_into_readmitted_slot_fails() {
        let (registry, _overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let stale = registry.try_begin_connecting(&address).expect("Admit");
        registry.release(&address);
        let _fresh = registry.try_begin_connecting(&address).expect("Re-admit");

        let result = registry.promote_to_bridging(&stale, unstarted_bridge(&address, 9100));
        assert_eq!(result, Err(RegistryError::StaleAttempt(address.clone())));
        // the fresh attempt is untouched
        assert_eq!(registry.state_of(&address), Some(LinkState::Connecting));
    }

    #[test]
    fn test_abort_attempt_only_matches_own_generation() {
        let (registry, _overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let stale = registry.try_begin_connecting(&address).expect("Admit");
        registry.release(&address);
        let _fresh = registry.try_begin_connecting(&address).expect("Re-admit");

        assert!(!registry.abort_attempt(&stale));
        assert!(registry.is_active(&address));
    }

    #[test]
    fn test_abort_attempt_ignores_promoted_slot() {
        let (registry, _overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let ticket = registry.try_begin_connecting(&address).expect("Admit");
        let bridge = unstarted_bridge(&address, 9100);
        registry
            .promote_to_bridging(&ticket, Arc::clone(&bridge))
            .expect("Promote");

        // a deadline firing after promotion must not tear the bridge down
        assert!(!registry.abort_attempt(&ticket));
        assert_eq!(registry.state_of(&address), Some(LinkState::Bridging));
        assert!(!bridge.is_closed());
    }

    #[test]
    fn test_release_ticket_spares_replacement_attempt() {
        let (registry, _overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let old = registry.try_begin_connecting(&address).expect("Admit");
        registry.release(&address);
        let _new = registry.try_begin_connecting(&address).expect("Re-admit");

        registry.release_ticket(&old);
        assert!(registry.is_active(&address));
    }

    #[test]
    fn test_inbound_refused_while_bridging_alive() {
        let (registry, _overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let ticket = registry.try_begin_connecting(&address).expect("Admit");
        registry
            .promote_to_bridging(&ticket, unstarted_bridge(&address, 9100))
            .expect("Promote");

        assert!(registry.admit_inbound(&address).is_none());
        assert_eq!(registry.state_of(&address), Some(LinkState::Bridging));
    }

    #[test]
    fn test_inbound_refused_while_connecting() {
        let (registry, _overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let _ticket = registry.try_begin_connecting(&address).expect("Admit");
        assert!(registry.admit_inbound(&address).is_none());
    }

    #[test]
    fn test_inbound_replaces_dead_bridge() {
        let (registry, overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        let ticket = registry.try_begin_connecting(&address).expect("Admit");
        let bridge = unstarted_bridge(&address, 9100);
        registry
            .promote_to_bridging(&ticket, Arc::clone(&bridge))
            .expect("Promote");

        // the bridge died but its exit hook has not deregistered it yet
        bridge.close();

        let replacement = registry.admit_inbound(&address).expect("Replace");
        assert_eq!(registry.state_of(&address), Some(LinkState::Connecting));
        assert_eq!(overlay.disconnected_ports(), vec![9100]);

        // the old attempt's exit hook fires late and must change nothing
        registry.release_ticket(&ticket);
        assert!(registry.is_active(&address));

        registry
            .promote_to_bridging(&replacement, unstarted_bridge(&address, 9101))
            .expect("Promote replacement");
        assert_eq!(registry.state_of(&address), Some(LinkState::Bridging));
    }

    #[test]
    fn test_release_all_empties_registry() {
        let (registry, _overlay) = registry();
        let first = PeerAddress::from("AA:01");
        let second = PeerAddress::from("AA:02");

        let ticket = registry.try_begin_connecting(&first).expect("Admit");
        let bridge = unstarted_bridge(&first, 9100);
        registry
            .promote_to_bridging(&ticket, Arc::clone(&bridge))
            .expect("Promote");
        registry.try_begin_connecting(&second).expect("Admit");

        registry.release_all();
        assert_eq!(registry.active_count(), 0);
        assert!(bridge.is_closed());
    }

    #[test]
    fn test_disconnect_failure_is_swallowed() {
        let mut mock = MockOverlay::new();
        mock.expect_disconnect_port()
            .times(1)
            .returning(|port| Err(OverlayError::DisconnectFailed(format!("port {port}"))));
        let registry = ConnectionRegistry::new(Arc::new(mock));
        let address = PeerAddress::from("AA:BB");

        let ticket = registry.try_begin_connecting(&address).expect("Admit");
        registry
            .promote_to_bridging(&ticket, unstarted_bridge(&address, 9100))
            .expect("Promote");

        // must not panic or propagate
        registry.release(&address);
        assert!(!registry.is_active(&address));
    }

    #[test]
    fn test_traffic_totals_fold_on_release() {
        let (registry, overlay) = registry();
        let address = PeerAddress::from("AA:BB");

        // a real loopback bridge so the counters move
        let hub = crate::transport::memory::MemoryHub::new();
        let a = hub.create_adapter("AA:01");
        let b = hub.create_adapter("AA:02");
        let listener = b.listen_channel().expect("Listen");
        let dialed = a
            .dial_channel(b.address(), listener.handle())
            .expect("Dial");
        let accepted = listener.accept().expect("Accept");
        let conduit = overlay
            .create_conduit(TransportKind::Local, PeerKind::Nearby)
            .expect("Create conduit");

        let ticket = registry.try_begin_connecting(&address).expect("Admit");
        let bridge = DuplexBridge::new(address.clone(), accepted, conduit, 64);
        registry
            .promote_to_bridging(&ticket, Arc::clone(&bridge))
            .expect("Promote");
        Arc::clone(&bridge).start(|| {});

        dialed.write_all(b"12345").expect("Write");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while registry.traffic_totals().0 < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(registry.traffic_totals().0, 5);

        registry.release(&address);
        assert_eq!(registry.traffic_totals().0, 5);
    }
}
