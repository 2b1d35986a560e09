//! In-memory loopback transport
//!
//! A process-local radio: adapters register on a shared hub, advertise to
//! one another, and dial channel connections that are plain in-memory byte
//! pipes. The test suite and the CLI demo run entire engines against it;
//! real deployments supply a platform-backed `RadioAdapter` instead.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::transport::api::{
    AdvertiseOptions, ChannelListener, ChannelSocket, MetadataSession, PeerAddress, RadioAdapter,
    ScanOptions, ScanResult, TransportError,
};
use crate::transport::handle::ChannelHandle;

/// Packet size the loopback transport reports, matching a typical
/// channel-oriented radio MTU.
pub const MEMORY_MTU: usize = 672;

const FIRST_HANDLE: u16 = 0x0080;
const LOOPBACK_RSSI: i8 = -40;

#[derive(Default)]
struct NodeState {
    powered: bool,
    advertising: Option<(u128, Vec<u8>)>,
    scanning: bool,
    metadata: HashMap<(u128, u16), Vec<u8>>,
    listeners: HashMap<u16, Arc<ListenerShared>>,
}

/// Shared registry of every loopback adapter in the process
pub struct MemoryHub {
    nodes: Mutex<HashMap<PeerAddress, NodeState>>,
    next_handle: AtomicU16,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            next_handle: AtomicU16::new(FIRST_HANDLE),
        })
    }

    /// Register a new powered-on adapter under the given address.
    pub fn create_adapter(self: &Arc<Self>, address: impl Into<String>) -> Arc<MemoryAdapter> {
        let address = PeerAddress::new(address);
        self.nodes.lock().insert(
            address.clone(),
            NodeState {
                powered: true,
                ..NodeState::default()
            },
        );
        Arc::new(MemoryAdapter {
            hub: Arc::clone(self),
            address,
        })
    }

    /// Scan results currently visible to `scanner`: every other powered node
    /// that is advertising. Hosts forward these into the engine, standing in
    /// for the platform's scan callback.
    pub fn visible_to(&self, scanner: &PeerAddress) -> Vec<ScanResult> {
        let nodes = self.nodes.lock();
        nodes
            .iter()
            .filter(|(address, node)| *address != scanner && node.powered)
            .filter_map(|(address, node)| {
                node.advertising.as_ref().map(|(service, _)| ScanResult {
                    address: address.clone(),
                    service_uuids: vec![*service],
                    connectable: true,
                    rssi: LOOPBACK_RSSI,
                })
            })
            .collect()
    }

    /// Flip a node's power state. Powered-off nodes stop advertising and
    /// refuse dials; the matching `AdapterEvent` is the host's to deliver.
    pub fn set_powered(&self, address: &PeerAddress, powered: bool) {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get_mut(address) {
            node.powered = powered;
            if !powered {
                node.advertising = None;
                node.scanning = false;
            }
        }
    }

    fn with_node<R>(
        &self,
        address: &PeerAddress,
        f: impl FnOnce(&mut NodeState) -> R,
    ) -> Result<R, TransportError> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(address)
            .ok_or(TransportError::AdapterUnavailable)?;
        Ok(f(node))
    }
}

// ---------------------------------------------------------------------------
// Channel listener
// ---------------------------------------------------------------------------

struct ListenerShared {
    pending: Mutex<VecDeque<Arc<MemorySocket>>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl ListenerShared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, socket: Arc<MemorySocket>) {
        self.pending.lock().push_back(socket);
        self.ready.notify_one();
    }

    fn accept(&self) -> Result<Arc<MemorySocket>, TransportError> {
        let mut pending = self.pending.lock();
        loop {
            if let Some(socket) = pending.pop_front() {
                return Ok(socket);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.ready.wait(&mut pending);
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // take the lock so a reader between its closed-check and its
            // wait cannot miss the wakeup
            let _pending = self.pending.lock();
            self.ready.notify_all();
        }
    }
}

struct MemoryListener {
    handle: ChannelHandle,
    shared: Arc<ListenerShared>,
    hub: Arc<MemoryHub>,
    owner: PeerAddress,
}

impl ChannelListener for MemoryListener {
    fn handle(&self) -> ChannelHandle {
        self.handle
    }

    fn accept(&self) -> Result<Arc<dyn ChannelSocket>, TransportError> {
        self.shared
            .accept()
            .map(|socket| socket as Arc<dyn ChannelSocket>)
    }

    fn close(&self) {
        self.shared.close();
        let mut nodes = self.hub.nodes.lock();
        if let Some(node) = nodes.get_mut(&self.owner) {
            node.listeners.remove(&self.handle.value());
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Socket pair
// ---------------------------------------------------------------------------

struct Pipe {
    data: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Pipe {
    fn new() -> Self {
        Self {
            data: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }
}

struct PairShared {
    dial_to_listen: Pipe,
    listen_to_dial: Pipe,
    closed: AtomicBool,
}

impl PairShared {
    fn new() -> Self {
        Self {
            dial_to_listen: Pipe::new(),
            listen_to_dial: Pipe::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // take each pipe's lock so a reader between its closed-check and
        // its wait cannot miss the wakeup
        for pipe in [&self.dial_to_listen, &self.listen_to_dial] {
            let _data = pipe.data.lock();
            pipe.ready.notify_all();
        }
    }
}

/// One end of an in-memory channel pair
pub struct MemorySocket {
    pair: Arc<PairShared>,
    dialer: bool,
    remote: PeerAddress,
}

impl MemorySocket {
    fn read_pipe(&self) -> &Pipe {
        if self.dialer {
            &self.pair.listen_to_dial
        } else {
            &self.pair.dial_to_listen
        }
    }

    fn write_pipe(&self) -> &Pipe {
        if self.dialer {
            &self.pair.dial_to_listen
        } else {
            &self.pair.listen_to_dial
        }
    }
}

impl ChannelSocket for MemorySocket {
    fn peer_address(&self) -> PeerAddress {
        self.remote.clone()
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let pipe = self.read_pipe();
        let mut data = pipe.data.lock();
        loop {
            if !data.is_empty() {
                let n = data.len().min(buf.len());
                for (slot, byte) in buf.iter_mut().zip(data.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if self.pair.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            pipe.ready.wait(&mut data);
        }
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), TransportError> {
        if self.pair.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let pipe = self.write_pipe();
        let mut data = pipe.data.lock();
        data.extend(buf.iter().copied());
        pipe.ready.notify_one();
        Ok(())
    }

    fn close(&self) {
        self.pair.close();
    }
}

// ---------------------------------------------------------------------------
// Metadata session
// ---------------------------------------------------------------------------

struct MemoryMetadataSession {
    hub: Arc<MemoryHub>,
    peer: PeerAddress,
    discovered: AtomicBool,
}

impl MetadataSession for MemoryMetadataSession {
    fn discover_services(&self) -> Result<(), TransportError> {
        let has_services = self
            .hub
            .with_node(&self.peer, |node| !node.metadata.is_empty())
            .map_err(|_| TransportError::SessionFailed("peer gone".to_string()))?;
        if !has_services {
            return Err(TransportError::ServiceNotFound);
        }
        self.discovered.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read_characteristic(
        &self,
        service: u128,
        characteristic: u16,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.discovered.load(Ordering::SeqCst) {
            return Err(TransportError::SessionFailed(
                "services not discovered".to_string(),
            ));
        }
        self.hub
            .with_node(&self.peer, |node| {
                node.metadata.get(&(service, characteristic)).cloned()
            })
            .map_err(|_| TransportError::SessionFailed("peer gone".to_string()))?
            .ok_or(TransportError::ServiceNotFound)
    }

    fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Loopback implementation of [`RadioAdapter`]
pub struct MemoryAdapter {
    hub: Arc<MemoryHub>,
    address: PeerAddress,
}

impl MemoryAdapter {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl RadioAdapter for MemoryAdapter {
    fn start_advertising(
        &self,
        service: u128,
        payload: &[u8],
        _options: AdvertiseOptions,
    ) -> Result<(), TransportError> {
        self.hub.with_node(&self.address, |node| {
            if !node.powered {
                return Err(TransportError::AdapterUnavailable);
            }
            node.advertising = Some((service, payload.to_vec()));
            Ok(())
        })?
    }

    fn stop_advertising(&self) {
        let _ = self.hub.with_node(&self.address, |node| {
            node.advertising = None;
        });
    }

    fn start_scanning(&self, _service: u128, _options: ScanOptions) -> Result<(), TransportError> {
        self.hub.with_node(&self.address, |node| {
            if !node.powered {
                return Err(TransportError::AdapterUnavailable);
            }
            node.scanning = true;
            Ok(())
        })?
    }

    fn stop_scanning(&self) {
        let _ = self.hub.with_node(&self.address, |node| {
            node.scanning = false;
        });
    }

    fn publish_metadata(&self, service: u128, characteristic: u16, value: Vec<u8>) {
        let _ = self.hub.with_node(&self.address, |node| {
            node.metadata.insert((service, characteristic), value);
        });
    }

    fn clear_metadata(&self) {
        let _ = self.hub.with_node(&self.address, |node| {
            node.metadata.clear();
        });
    }

    fn listen_channel(&self) -> Result<Arc<dyn ChannelListener>, TransportError> {
        let value = self.hub.next_handle.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(ListenerShared::new());
        self.hub.with_node(&self.address, |node| {
            node.listeners.insert(value, Arc::clone(&shared));
        })?;
        debug!(owner = %self.address, handle = value, "loopback listener open");
        Ok(Arc::new(MemoryListener {
            handle: ChannelHandle::new(value),
            shared,
            hub: Arc::clone(&self.hub),
            owner: self.address.clone(),
        }))
    }

    fn dial_channel(
        &self,
        peer: &PeerAddress,
        handle: ChannelHandle,
    ) -> Result<Arc<dyn ChannelSocket>, TransportError> {
        let listener = {
            let nodes = self.hub.nodes.lock();
            let node = nodes
                .get(peer)
                .ok_or_else(|| TransportError::DialFailed(format!("unknown peer {peer}")))?;
            if !node.powered {
                return Err(TransportError::DialFailed(format!("peer {peer} is off")));
            }
            node.listeners
                .get(&handle.value())
                .cloned()
                .ok_or_else(|| TransportError::DialFailed(format!("no listener on {handle}")))?
        };
        if listener.closed.load(Ordering::SeqCst) {
            return Err(TransportError::DialFailed(format!(
                "listener on {handle} is closed"
            )));
        }
        let pair = Arc::new(PairShared::new());
        let local = Arc::new(MemorySocket {
            pair: Arc::clone(&pair),
            dialer: true,
            remote: peer.clone(),
        });
        let remote = Arc::new(MemorySocket {
            pair,
            dialer: false,
            remote: self.address.clone(),
        });
        listener.push(remote);
        Ok(local)
    }

    fn open_metadata_session(
        &self,
        peer: &PeerAddress,
    ) -> Result<Box<dyn MetadataSession>, TransportError> {
        let exists = self.hub.nodes.lock().get(peer).map(|node| node.powered);
        match exists {
            Some(true) => Ok(Box::new(MemoryMetadataSession {
                hub: Arc::clone(&self.hub),
                peer: peer.clone(),
                discovered: AtomicBool::new(false),
            })),
            Some(false) => Err(TransportError::SessionFailed(format!("peer {peer} is off"))),
            None => Err(TransportError::SessionFailed(format!("unknown peer {peer}"))),
        }
    }

    fn is_powered(&self) -> bool {
        self.hub
            .nodes
            .lock()
            .get(&self.address)
            .map(|node| node.powered)
            .unwrap_or(false)
    }

    fn max_packet_size(&self) -> usize {
        MEMORY_MTU
    }
}
