//! Channel negotiation — the out-of-band exchange of a listening handle
//!
//! Two roles with a symmetric outcome. The listening role publishes its
//! 2-byte handle in a readable metadata slot under the channel service UUID;
//! the connecting role reads it over a metadata session and dials. A failed
//! attempt is simply abandoned; rediscovery is the retry mechanism.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::transport::api::{
    ChannelSocket, MetadataSession, PeerAddress, RadioAdapter, TransportError,
};
use crate::transport::handle::{
    ChannelHandle, HandleError, CHANNEL_HANDLE_CHARACTERISTIC, CHANNEL_SERVICE_UUID,
};

/// Errors that abort a single negotiation attempt
#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    #[error("Metadata session failed: {0}")]
    SessionFailed(TransportError),

    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(TransportError),

    #[error("Handle read failed: {0}")]
    HandleReadFailed(TransportError),

    #[error("Malformed handle: {0}")]
    MalformedHandle(#[from] HandleError),

    #[error("Channel dial failed: {0}")]
    DialFailed(TransportError),
}

/// Listening role: expose `handle` in the advertised metadata slot.
pub fn publish_handle(adapter: &dyn RadioAdapter, handle: ChannelHandle) {
    adapter.publish_metadata(
        CHANNEL_SERVICE_UUID,
        CHANNEL_HANDLE_CHARACTERISTIC,
        handle.encode().to_vec(),
    );
}

/// Connecting role of the handle exchange
pub struct ChannelNegotiator {
    adapter: Arc<dyn RadioAdapter>,
}

impl ChannelNegotiator {
    pub fn new(adapter: Arc<dyn RadioAdapter>) -> Self {
        Self { adapter }
    }

    /// Fetch the peer's advertised handle and dial a direct channel to it.
    /// Blocking; runs on a negotiation worker thread.
    pub fn connect(&self, peer: &PeerAddress) -> Result<Arc<dyn ChannelSocket>, NegotiationError> {
        let handle = self.fetch_handle(peer)?;
        debug!(peer = %peer, %handle, "dialing channel");
        self.adapter
            .dial_channel(peer, handle)
            .map_err(NegotiationError::DialFailed)
    }

    /// Read the peer's 2-byte handle from its metadata slot. The session is
    /// closed on every path. The handle is stable for the peer's discovery
    /// session but must be re-fetched whenever the peer reconnects.
    pub fn fetch_handle(&self, peer: &PeerAddress) -> Result<ChannelHandle, NegotiationError> {
        let session = self
            .adapter
            .open_metadata_session(peer)
            .map_err(NegotiationError::SessionFailed)?;
        let result = Self::read_handle(session.as_ref());
        session.close();
        result
    }

    fn read_handle(session: &dyn MetadataSession) -> Result<ChannelHandle, NegotiationError> {
        session
            .discover_services()
            .map_err(NegotiationError::DiscoveryFailed)?;
        let raw = session
            .read_characteristic(CHANNEL_SERVICE_UUID, CHANNEL_HANDLE_CHARACTERISTIC)
            .map_err(NegotiationError::HandleReadFailed)?;
        Ok(ChannelHandle::decode(&raw)?)
    }
}
