//! Discovery coordination — advertise/scan lifecycle and the accept loop
//!
//! Every state transition runs on one event-loop thread; radio callbacks
//! and configuration setters only enqueue events. Blocking work (channel
//! accept, negotiation, the copy loops) lives on dedicated threads so the
//! platform's callback-delivery thread is never stalled.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::bridge::DuplexBridge;
use crate::engine::negotiator::{publish_handle, ChannelNegotiator};
use crate::engine::registry::{ConnectTicket, ConnectionRegistry};
use crate::overlay::{Overlay, PeerKind, TransportKind};
use crate::transport::api::{
    AdapterEvent, AdvertiseOptions, ChannelListener, ChannelSocket, RadioAdapter, ScanOptions,
    ScanResult,
};
use crate::transport::handle::CHANNEL_SERVICE_UUID;

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Active,
}

/// Counters exposed through [`DiscoveryService::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Scan results admitted for outbound negotiation
    pub peers_discovered: u64,
    /// Inbound channels admitted
    pub inbound_accepted: u64,
    /// Bridges that reached the running state
    pub bridges_opened: u64,
    /// Bytes relayed from peers into the overlay
    pub bytes_to_overlay: u64,
    /// Bytes relayed from the overlay out to peers
    pub bytes_to_peer: u64,
}

enum EngineEvent {
    Start,
    Stop,
    Scan(ScanResult),
    Adapter(AdapterEvent),
    SetBluetoothEnabled(bool),
    SetCodedPhyPreferred(bool),
    AttemptExpired(ConnectTicket),
    Shutdown,
}

struct ListenSession {
    listener: Arc<dyn ChannelListener>,
    accept_thread: Option<JoinHandle<()>>,
}

struct ServiceInner {
    adapter: Arc<dyn RadioAdapter>,
    overlay: Arc<dyn Overlay>,
    registry: Arc<ConnectionRegistry>,
    negotiator: ChannelNegotiator,
    transport_kind: TransportKind,
    config: Mutex<EngineConfig>,
    state: Mutex<EngineState>,
    session: Mutex<Option<ListenSession>>,
    adapter_powered: AtomicBool,
    events: UnboundedSender<EngineEvent>,
    peers_discovered: AtomicU64,
    inbound_accepted: AtomicU64,
    bridges_opened: AtomicU64,
}

/// The engine entry point: owns discovery, negotiation dispatch, and the
/// inbound-accept loop; creates bridges through the registry.
pub struct DiscoveryService {
    inner: Arc<ServiceInner>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Spawn the engine's event loop. The engine stays `Stopped` until
    /// [`start`] is called.
    ///
    /// [`start`]: Self::start
    pub fn spawn(
        adapter: Arc<dyn RadioAdapter>,
        overlay: Arc<dyn Overlay>,
        config: EngineConfig,
    ) -> Self {
        Self::spawn_with_kind(adapter, overlay, config, TransportKind::Bluetooth)
    }

    /// Like [`spawn`], tagging conduits with the given transport kind.
    ///
    /// [`spawn`]: Self::spawn
    pub fn spawn_with_kind(
        adapter: Arc<dyn RadioAdapter>,
        overlay: Arc<dyn Overlay>,
        config: EngineConfig,
        transport_kind: TransportKind,
    ) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let powered = adapter.is_powered();
        let inner = Arc::new(ServiceInner {
            registry: Arc::new(ConnectionRegistry::new(Arc::clone(&overlay))),
            negotiator: ChannelNegotiator::new(Arc::clone(&adapter)),
            adapter,
            overlay,
            transport_kind,
            config: Mutex::new(config),
            state: Mutex::new(EngineState::Stopped),
            session: Mutex::new(None),
            adapter_powered: AtomicBool::new(powered),
            events,
            peers_discovered: AtomicU64::new(0),
            inbound_accepted: AtomicU64::new(0),
            bridges_opened: AtomicU64::new(0),
        });

        let loop_inner = Arc::clone(&inner);
        let event_thread = std::thread::Builder::new()
            .name("nearlink-events".to_string())
            .spawn(move || loop_inner.run_event_loop(receiver));
        let event_thread = match event_thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(%err, "failed to spawn engine event loop");
                None
            }
        };

        Self {
            inner,
            event_thread: Mutex::new(event_thread),
        }
    }

    /// Request a transition to `Active`. No-op while the bluetooth flag is
    /// off or the adapter is powered down.
    pub fn start(&self) {
        self.post(EngineEvent::Start);
    }

    /// Request a transition to `Stopped`, releasing every peer.
    pub fn stop(&self) {
        self.post(EngineEvent::Stop);
    }

    /// Forward a platform scan callback into the engine. Never blocks.
    pub fn handle_scan_result(&self, result: ScanResult) {
        self.post(EngineEvent::Scan(result));
    }

    /// Forward an adapter power transition into the engine. Never blocks.
    pub fn handle_adapter_event(&self, event: AdapterEvent) {
        self.post(EngineEvent::Adapter(event));
    }

    /// Flip the bluetooth preference; cycles the engine.
    pub fn set_bluetooth_enabled(&self, enabled: bool) {
        self.post(EngineEvent::SetBluetoothEnabled(enabled));
    }

    /// Flip the coded-PHY preference; cycles the engine.
    pub fn set_coded_phy_preferred(&self, preferred: bool) {
        self.post(EngineEvent::SetCodedPhyPreferred(preferred));
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    pub fn config(&self) -> EngineConfig {
        self.inner.config.lock().clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    /// Overlay peers currently reachable over this engine's transport.
    pub fn peer_count(&self) -> usize {
        self.inner.overlay.peer_count(PeerKind::Nearby)
    }

    pub fn stats(&self) -> EngineStats {
        let (bytes_to_overlay, bytes_to_peer) = self.inner.registry.traffic_totals();
        EngineStats {
            peers_discovered: self.inner.peers_discovered.load(Ordering::Relaxed),
            inbound_accepted: self.inner.inbound_accepted.load(Ordering::Relaxed),
            bridges_opened: self.inner.bridges_opened.load(Ordering::Relaxed),
            bytes_to_overlay,
            bytes_to_peer,
        }
    }

    /// Stop the engine and terminate the event loop. Idempotent; also runs
    /// on drop.
    pub fn shutdown(&self) {
        self.post(EngineEvent::Shutdown);
        let thread = self.event_thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("engine event loop panicked");
            }
        }
    }

    fn post(&self, event: EngineEvent) {
        // send only fails once the loop has shut down; late events are moot
        let _ = self.inner.events.send(event);
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServiceInner {
    fn run_event_loop(self: Arc<Self>, mut receiver: UnboundedReceiver<EngineEvent>) {
        debug!("engine event loop running");
        while let Some(event) = receiver.blocking_recv() {
            match event {
                EngineEvent::Start => Self::try_start_engine(&self, "start requested"),
                EngineEvent::Stop => self.stop_engine("stop requested"),
                EngineEvent::Scan(result) => Self::on_scan_result(&self, result),
                EngineEvent::Adapter(AdapterEvent::PoweredOn) => {
                    self.adapter_powered.store(true, Ordering::SeqCst);
                    Self::try_start_engine(&self, "adapter powered on");
                }
                EngineEvent::Adapter(AdapterEvent::PoweredOff) => {
                    self.adapter_powered.store(false, Ordering::SeqCst);
                    self.stop_engine("adapter powering off");
                }
                EngineEvent::SetBluetoothEnabled(enabled) => {
                    self.config.lock().bluetooth_enabled = enabled;
                    self.stop_engine("bluetooth preference changed");
                    Self::try_start_engine(&self, "bluetooth preference changed");
                }
                EngineEvent::SetCodedPhyPreferred(preferred) => {
                    self.config.lock().coded_phy_preferred = preferred;
                    self.stop_engine("phy preference changed");
                    Self::try_start_engine(&self, "phy preference changed");
                }
                EngineEvent::AttemptExpired(ticket) => {
                    if self.registry.abort_attempt(&ticket) {
                        warn!(peer = %ticket.address(), "negotiation attempt timed out");
                    }
                }
                EngineEvent::Shutdown => {
                    self.stop_engine("shutting down");
                    break;
                }
            }
        }
        debug!("engine event loop terminated");
    }

    fn try_start_engine(this: &Arc<Self>, reason: &str) {
        if *this.state.lock() == EngineState::Active {
            return;
        }
        let config = this.config.lock().clone();
        if !config.bluetooth_enabled {
            debug!(reason, "engine disabled, staying stopped");
            return;
        }
        if !this.adapter_powered.load(Ordering::SeqCst) {
            debug!(reason, "adapter off, staying stopped");
            return;
        }
        Self::start_engine(this, &config, reason);
    }

    fn start_engine(this: &Arc<Self>, config: &EngineConfig, reason: &str) {
        info!(reason, "starting discovery engine");
        *this.state.lock() = EngineState::Starting;

        // idempotent reset of whatever a previous session left behind
        this.adapter.stop_advertising();
        this.adapter.stop_scanning();
        this.adapter.clear_metadata();
        this.close_session();
        this.registry.release_all();

        let listener = match this.adapter.listen_channel() {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%err, "channel listen failed, engine stays stopped");
                *this.state.lock() = EngineState::Stopped;
                return;
            }
        };
        let handle = listener.handle();
        publish_handle(this.adapter.as_ref(), handle);

        let advertise = AdvertiseOptions {
            coded_phy: config.coded_phy_preferred,
        };
        if let Err(err) = this
            .adapter
            .start_advertising(CHANNEL_SERVICE_UUID, &[], advertise)
        {
            warn!(%err, "advertising failed, engine stays stopped");
            this.rollback_start(&listener);
            return;
        }

        let scan = ScanOptions {
            coded_phy: config.coded_phy_preferred,
        };
        if let Err(err) = this.adapter.start_scanning(CHANNEL_SERVICE_UUID, scan) {
            warn!(%err, "scanning failed, engine stays stopped");
            this.adapter.stop_advertising();
            this.rollback_start(&listener);
            return;
        }

        let accept_inner = Arc::clone(this);
        let accept_listener = Arc::clone(&listener);
        let accept_thread = std::thread::Builder::new()
            .name("nearlink-accept".to_string())
            .spawn(move || accept_inner.run_accept_loop(accept_listener));
        match accept_thread {
            Ok(thread) => {
                *this.session.lock() = Some(ListenSession {
                    listener,
                    accept_thread: Some(thread),
                });
                *this.state.lock() = EngineState::Active;
                info!(%handle, "discovery engine active");
            }
            Err(err) => {
                warn!(%err, "failed to spawn accept loop, engine stays stopped");
                this.adapter.stop_advertising();
                this.adapter.stop_scanning();
                this.rollback_start(&listener);
            }
        }
    }

    fn rollback_start(&self, listener: &Arc<dyn ChannelListener>) {
        listener.close();
        self.adapter.clear_metadata();
        *self.state.lock() = EngineState::Stopped;
    }

    fn stop_engine(&self, reason: &str) {
        if *self.state.lock() == EngineState::Stopped {
            return;
        }
        info!(reason, "stopping discovery engine");
        self.adapter.stop_advertising();
        self.adapter.stop_scanning();
        self.adapter.clear_metadata();
        self.close_session();
        self.registry.release_all();
        if let Err(err) = self.overlay.disconnect_all(PeerKind::Nearby) {
            debug!(%err, "overlay disconnect-all notification failed");
        }
        *self.state.lock() = EngineState::Stopped;
    }

    fn close_session(&self) {
        let session = self.session.lock().take();
        if let Some(mut session) = session {
            session.listener.close();
            if let Some(thread) = session.accept_thread.take() {
                if thread.join().is_err() {
                    warn!("accept loop panicked");
                }
            }
        }
    }

    fn run_accept_loop(self: Arc<Self>, listener: Arc<dyn ChannelListener>) {
        debug!("accept loop running");
        loop {
            match listener.accept() {
                Ok(socket) => self.handle_inbound(socket),
                Err(err) => {
                    debug!(%err, "accept loop ending");
                    break;
                }
            }
        }
    }

    fn handle_inbound(&self, socket: Arc<dyn ChannelSocket>) {
        let peer = socket.peer_address();
        let Some(ticket) = self.registry.admit_inbound(&peer) else {
            debug!(peer = %peer, "inbound refused, closing duplicate channel");
            socket.close();
            return;
        };
        self.inbound_accepted.fetch_add(1, Ordering::Relaxed);
        self.establish(ticket, socket);
    }

    fn on_scan_result(this: &Arc<Self>, result: ScanResult) {
        if *this.state.lock() != EngineState::Active {
            return;
        }
        if !result.connectable || !result.advertises(CHANNEL_SERVICE_UUID) {
            return;
        }
        let peer = result.address;
        if this.registry.is_active(&peer) {
            return;
        }
        let Some(ticket) = this.registry.try_begin_connecting(&peer) else {
            return;
        };
        this.peers_discovered.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, rssi = result.rssi, "peer discovered, negotiating");

        this.schedule_attempt_deadline(ticket.clone());
        let worker_inner = Arc::clone(this);
        let worker_ticket = ticket.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("nearlink-connect-{peer}"))
            .spawn(move || worker_inner.run_connect_attempt(worker_ticket));
        if let Err(err) = spawned {
            warn!(peer = %peer, %err, "failed to spawn connect worker");
            this.registry.abort_attempt(&ticket);
        }
    }

    fn run_connect_attempt(self: Arc<Self>, ticket: ConnectTicket) {
        let peer = ticket.address().clone();
        match self.negotiator.connect(&peer) {
            Ok(socket) => self.establish(ticket, socket),
            Err(err) => {
                debug!(peer = %peer, %err, "negotiation failed, releasing slot");
                self.registry.abort_attempt(&ticket);
            }
        }
    }

    /// Shared tail of both connection paths: conduit, promotion, bridge.
    fn establish(&self, ticket: ConnectTicket, socket: Arc<dyn ChannelSocket>) {
        let peer = ticket.address().clone();
        let conduit = match self
            .overlay
            .create_conduit(self.transport_kind, PeerKind::Nearby)
        {
            Ok(conduit) => conduit,
            Err(err) => {
                warn!(peer = %peer, %err, "conduit creation failed");
                socket.close();
                self.registry.abort_attempt(&ticket);
                return;
            }
        };

        let bridge = DuplexBridge::new(peer.clone(), socket, conduit, self.adapter.max_packet_size());
        match self.registry.promote_to_bridging(&ticket, Arc::clone(&bridge)) {
            Ok(()) => {
                self.bridges_opened.fetch_add(1, Ordering::Relaxed);
                let registry = Arc::clone(&self.registry);
                bridge.start(move || registry.release_ticket(&ticket));
                info!(peer = %peer, "bridge established");
            }
            Err(err) => {
                // the slot was released or re-admitted while we were connecting
                debug!(peer = %peer, %err, "promotion refused, discarding orphan bridge");
                bridge.close();
            }
        }
    }

    fn schedule_attempt_deadline(&self, ticket: ConnectTicket) {
        let timeout = self.config.lock().attempt_timeout();
        let events = self.events.clone();
        let spawned = std::thread::Builder::new()
            .name("nearlink-deadline".to_string())
            .spawn(move || {
                std::thread::sleep(timeout);
                let _ = events.send(EngineEvent::AttemptExpired(ticket));
            });
        if spawned.is_err() {
            debug!("failed to spawn attempt deadline timer");
        }
    }
}
