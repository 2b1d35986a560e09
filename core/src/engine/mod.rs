// Engine module — registry, bridge, negotiation, and coordination

pub mod bridge;
pub mod coordinator;
pub mod negotiator;
pub mod registry;

pub use bridge::DuplexBridge;
pub use coordinator::{DiscoveryService, EngineState, EngineStats};
pub use negotiator::{publish_handle, ChannelNegotiator, NegotiationError};
pub use registry::{ConnectTicket, ConnectionRegistry, LinkState, RegistryError};
