// Nearlink Core — short-range discovery and overlay bridging engine
//
// Discovers nearby peers over a short-range radio, negotiates a direct
// channel with each one, and pumps opaque bytes between that channel and a
// per-peer overlay conduit. No IP connectivity required on either side.

pub mod config;
pub mod engine;
pub mod overlay;
pub mod transport;

pub use config::{ConfigError, EngineConfig};
pub use engine::{
    ChannelNegotiator, ConnectTicket, ConnectionRegistry, DiscoveryService, DuplexBridge,
    EngineState, EngineStats, LinkState, NegotiationError, RegistryError,
};
pub use overlay::{Conduit, Overlay, OverlayError, PeerKind, TransportKind};
pub use transport::{
    AdapterEvent, AdvertiseOptions, ChannelHandle, ChannelListener, ChannelSocket, HandleError,
    MetadataSession, PeerAddress, RadioAdapter, ScanOptions, ScanResult, TransportError,
    CHANNEL_HANDLE_CHARACTERISTIC, CHANNEL_SERVICE_UUID,
};
