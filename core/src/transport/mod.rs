// Transport module — radio abstraction, handle codec, loopback hub

pub mod api;
pub mod handle;
pub mod memory;

pub use api::{
    AdapterEvent, AdvertiseOptions, ChannelListener, ChannelSocket, MetadataSession, PeerAddress,
    RadioAdapter, ScanOptions, ScanResult, TransportError,
};
pub use handle::{
    ChannelHandle, HandleError, CHANNEL_HANDLE_CHARACTERISTIC, CHANNEL_HANDLE_LEN,
    CHANNEL_SERVICE_UUID,
};
pub use memory::{MemoryAdapter, MemoryHub, MEMORY_MTU};
