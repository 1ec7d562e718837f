//! Error types for the badge link.
//!
//! `TransportError` is what the radio layer reports, unchanged. `LinkError`
//! is the classified form the supervisor, transfer and facade hand upwards.

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::types::AdapterState;

/// Failures reported verbatim by a [`Transport`](super::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,

    #[error("device not found")]
    NotFound,

    #[error("device disconnected")]
    Disconnected,

    #[error("not authorized to use the Bluetooth radio")]
    Unauthorized,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Failures auto-connect answers by falling back to a scan.
    pub fn is_absent(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::NotFound)
    }
}

/// Main error type for link operations
#[derive(Debug, Error)]
pub enum LinkError {
    /// Adapter powered off or access denied
    #[error("Bluetooth radio unavailable ({0:?})")]
    RadioUnavailable(AdapterState),

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("device not found")]
    DeviceNotFound,

    #[error("device disconnected unexpectedly")]
    UnexpectedDisconnect,

    /// Service found but no writable characteristic matched
    #[error("no writable characteristic {characteristic} in service {service}")]
    CharacteristicMissing { service: Uuid, characteristic: Uuid },

    #[error("chunk at offset {offset} could not be sent: {source}")]
    ChunkSendFailed {
        offset: usize,
        #[source]
        source: TransportError,
    },

    #[error("characteristic is no longer writable")]
    NotWritable,

    /// A single write would exceed the negotiated payload limit
    #[error("command is {len} bytes, the link accepts at most {limit} per write")]
    PayloadTooLarge { len: usize, limit: usize },

    /// The link dropped while a send was in progress
    #[error("device disconnected during transfer (offset {offset})")]
    Disconnected { offset: usize },

    #[error("write failed: {0}")]
    WriteFailed(#[source] TransportError),

    #[error("no badge connected")]
    NotConnected,

    #[error("another operation is already in progress")]
    Busy,

    #[error("invalid color {0:?}, expected #RRGGBB")]
    InvalidColor(String),

    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("image error: {0}")]
    Image(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("could not encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection failed: {0}")]
    Connection(#[source] TransportError),
}

impl From<TransportError> for LinkError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout => LinkError::ConnectTimeout,
            TransportError::NotFound => LinkError::DeviceNotFound,
            TransportError::Disconnected => LinkError::UnexpectedDisconnect,
            TransportError::Unauthorized => LinkError::RadioUnavailable(AdapterState::Unauthorized),
            other => LinkError::Connection(other),
        }
    }
}

impl From<image::ImageError> for LinkError {
    fn from(error: image::ImageError) -> Self {
        LinkError::Image(error.to_string())
    }
}

impl LinkError {
    /// Message suitable for showing to whoever triggered the operation.
    pub fn user_message(&self) -> String {
        match self {
            LinkError::ConnectTimeout => {
                "Connection timeout. Make sure the badge is nearby and powered on.".to_string()
            }
            LinkError::DeviceNotFound => "Device not found. Try scanning again.".to_string(),
            LinkError::UnexpectedDisconnect | LinkError::Disconnected { .. } => {
                "Device disconnected. Please reconnect.".to_string()
            }
            LinkError::RadioUnavailable(AdapterState::Unauthorized) => {
                "Bluetooth permission is denied. Please enable it in system settings.".to_string()
            }
            LinkError::RadioUnavailable(state) => {
                format!("Bluetooth not ready. Current state: {:?}", state)
            }
            LinkError::NotConnected => "Please connect to your badge first.".to_string(),
            LinkError::PayloadTooLarge { .. } => {
                "Text or caption is too long for the badge. Please shorten it.".to_string()
            }
            other => other.to_string(),
        }
    }
}
