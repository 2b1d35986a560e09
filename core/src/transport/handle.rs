/// Channel handle codec
///
/// A channel handle designates the endpoint a peer is listening on for
/// direct channel connections. It travels as exactly two big-endian bytes in
/// a readable metadata slot tied to the channel service UUID; the connecting
/// role re-fetches it on every reconnect.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Service UUID advertised by nodes accepting direct channel connections.
pub const CHANNEL_SERVICE_UUID: u128 = 0x4E4C_0001_0000_1000_8000_00805F9B34FB;

/// Characteristic carrying the 2-byte channel handle (short form).
pub const CHANNEL_HANDLE_CHARACTERISTIC: u16 = 0x4E02;

/// Encoded size of a channel handle on the wire.
pub const CHANNEL_HANDLE_LEN: usize = 2;

/// Errors for channel handle decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("Handle payload must be 2 bytes, got {0}")]
    BadLength(usize),
}

/// Numeric identifier of a channel listening endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle(u16);

impl ChannelHandle {
    /// Create a handle from its numeric value
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the numeric handle value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Encode as 2 big-endian bytes
    pub fn encode(&self) -> [u8; CHANNEL_HANDLE_LEN] {
        self.0.to_be_bytes()
    }

    /// Decode from exactly 2 big-endian bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, HandleError> {
        if bytes.len() != CHANNEL_HANDLE_LEN {
            return Err(HandleError::BadLength(bytes.len()));
        }
        Ok(Self(u16::from_be_bytes([bytes[0], bytes[1]])))
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}
