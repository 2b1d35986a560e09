//! Overlay conduit abstraction
//!
//! The engine bridges radio channels into a peer-to-peer overlay it does not
//! implement. A conduit is the overlay's per-peer duplex byte stream,
//! multiplexed onto the wider network by the overlay library; the engine
//! only creates one per bridged peer and pumps opaque bytes through it.

pub mod memory;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::{MemoryConduit, MemoryOverlay};

/// Transport a conduit is tagged with at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bluetooth channel-oriented connections
    Bluetooth,
    /// WiFi Aware data paths
    WiFiAware,
    /// In-process loopback for testing
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Bluetooth => write!(f, "Bluetooth"),
            TransportKind::WiFiAware => write!(f, "WiFiAware"),
            TransportKind::Local => write!(f, "Local"),
        }
    }
}

/// Overlay-side classification of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerKind {
    /// Reached over a short-range radio link
    Nearby,
    /// Reached over the internet
    Internet,
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKind::Nearby => write!(f, "Nearby"),
            PeerKind::Internet => write!(f, "Internet"),
        }
    }
}

/// Errors surfaced by the overlay library
#[derive(Error, Debug, Clone)]
pub enum OverlayError {
    #[error("Conduit creation failed: {0}")]
    CreateFailed(String),

    #[error("Conduit closed")]
    Closed,

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
}

/// Connection-management surface of the overlay library
#[cfg_attr(test, mockall::automock)]
pub trait Overlay: Send + Sync {
    /// Create a fresh conduit for one peer.
    fn create_conduit(
        &self,
        transport: TransportKind,
        peer: PeerKind,
    ) -> Result<Arc<dyn Conduit>, OverlayError>;

    /// Ask the overlay to drop the transport port behind a released conduit.
    /// Best-effort: callers log failures and move on.
    fn disconnect_port(&self, port: u16) -> Result<(), OverlayError>;

    /// Drop every overlay connection of the given peer kind.
    fn disconnect_all(&self, peer: PeerKind) -> Result<(), OverlayError>;

    fn peer_count(&self, peer: PeerKind) -> usize;
}

/// The overlay's per-peer duplex byte stream
pub trait Conduit: Send + Sync {
    /// Overlay-assigned port identifying this conduit's transport slot.
    fn port(&self) -> u16;

    /// Blocking read of bytes the overlay wants sent to the peer. `Ok(0)`
    /// means no data yet; closure surfaces as `Err(OverlayError::Closed)`.
    fn read(&self, buf: &mut [u8]) -> Result<usize, OverlayError>;

    /// Hand bytes received from the peer to the overlay.
    fn write_all(&self, buf: &[u8]) -> Result<(), OverlayError>;

    /// Idempotent.
    fn close(&self);
}
