//! Radio transport abstraction
//!
//! The engine never talks to radio hardware directly. Platform integrations
//! implement this trait family; the loopback hub in `memory` implements it
//! for tests and the CLI demo.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::transport::handle::ChannelHandle;

/// Stable identifier for a radio peer (string form of the hardware address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

/// Errors that can occur in the transport layer
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Adapter unavailable")]
    AdapterUnavailable,

    #[error("Advertise failed: {0}")]
    AdvertiseFailed(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Listen failed: {0}")]
    ListenFailed(String),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Metadata session failed: {0}")]
    SessionFailed(String),

    #[error("Service not found")]
    ServiceNotFound,

    #[error("Characteristic read failed: {0}")]
    CharacteristicReadFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Channel closed")]
    Closed,
}

/// Advertising options
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdvertiseOptions {
    /// Prefer the long-range coded PHY
    pub coded_phy: bool,
}

/// Scanning options
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Prefer the long-range coded PHY
    pub coded_phy: bool,
}

/// A scan result delivered by the platform scanner
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Address of the advertising peer
    pub address: PeerAddress,
    /// Service UUIDs present in the advertised payload
    pub service_uuids: Vec<u128>,
    /// Whether the advertisement accepts connections
    pub connectable: bool,
    /// Received signal strength in dBm
    pub rssi: i8,
}

impl ScanResult {
    /// Check whether the advertisement carries the given service UUID
    pub fn advertises(&self, service: u128) -> bool {
        self.service_uuids.contains(&service)
    }
}

/// Adapter power transitions reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    PoweredOn,
    PoweredOff,
}

/// Capability surface of the host radio stack.
///
/// Scan results and adapter transitions are delivered by the platform as
/// callbacks; hosts forward them into the engine via
/// `DiscoveryService::handle_scan_result` / `handle_adapter_event`.
pub trait RadioAdapter: Send + Sync {
    /// Begin advertising the given service with an attached payload.
    fn start_advertising(
        &self,
        service: u128,
        payload: &[u8],
        options: AdvertiseOptions,
    ) -> Result<(), TransportError>;

    /// Idempotent.
    fn stop_advertising(&self);

    /// Begin scanning, filtered to the given service.
    fn start_scanning(&self, service: u128, options: ScanOptions) -> Result<(), TransportError>;

    /// Idempotent.
    fn stop_scanning(&self);

    /// Expose a readable, permissionless metadata value under the given
    /// service; peers fetch it with `MetadataSession::read_characteristic`.
    fn publish_metadata(&self, service: u128, characteristic: u16, value: Vec<u8>);

    /// Remove every published metadata value. Idempotent.
    fn clear_metadata(&self);

    /// Open a fresh channel listener and allocate its handle.
    fn listen_channel(&self) -> Result<Arc<dyn ChannelListener>, TransportError>;

    /// Dial a direct channel to a peer's listening handle. Blocking.
    fn dial_channel(
        &self,
        peer: &PeerAddress,
        handle: ChannelHandle,
    ) -> Result<Arc<dyn ChannelSocket>, TransportError>;

    /// Open a metadata session with a peer. Blocking.
    fn open_metadata_session(
        &self,
        peer: &PeerAddress,
    ) -> Result<Box<dyn MetadataSession>, TransportError>;

    fn is_powered(&self) -> bool;

    /// Largest packet the transport carries in one read or write.
    fn max_packet_size(&self) -> usize;
}

/// A listening channel endpoint
pub trait ChannelListener: Send + Sync {
    /// The handle peers must dial to reach this listener.
    fn handle(&self) -> ChannelHandle;

    /// Block until an inbound channel arrives or the listener is closed.
    fn accept(&self) -> Result<Arc<dyn ChannelSocket>, TransportError>;

    /// Unblock any pending accept. Idempotent.
    fn close(&self);
}

/// A direct duplex byte channel to one peer
pub trait ChannelSocket: Send + Sync {
    fn peer_address(&self) -> PeerAddress;

    /// Blocking read. `Ok(0)` means no data yet, not end-of-stream; closure
    /// of either end surfaces as `Err(TransportError::Closed)`.
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write_all(&self, buf: &[u8]) -> Result<(), TransportError>;

    /// Idempotent; unblocks reads on both ends.
    fn close(&self);
}

/// A short-lived metadata (service discovery + characteristic read) session
pub trait MetadataSession: Send {
    /// Must complete before any characteristic read.
    fn discover_services(&self) -> Result<(), TransportError>;

    fn read_characteristic(
        &self,
        service: u128,
        characteristic: u16,
    ) -> Result<Vec<u8>, TransportError>;

    /// Idempotent.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::handle::CHANNEL_SERVICE_UUID;

    #[test]
    fn test_peer_address_display() {
        let address = PeerAddress::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(address.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(address.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_peer_address_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(PeerAddress::from("AA:BB"), 1);
        map.insert(PeerAddress::from("AA:BB"), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&PeerAddress::from("AA:BB")], 2);
    }

    #[test]
    fn test_scan_result_advertises() {
        let result = ScanResult {
            address: PeerAddress::from("AA:BB"),
            service_uuids: vec![CHANNEL_SERVICE_UUID],
            connectable: true,
            rssi: -40,
        };
        assert!(result.advertises(CHANNEL_SERVICE_UUID));
        assert!(!result.advertises(0xDEAD));
    }
}
