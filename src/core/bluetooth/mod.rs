//! Bluetooth link to the badge
//! This module handles all bluetooth operations including scanning,
//! connecting, supervising the connection and streaming content to the badge.

mod bluest_transport;
pub mod commands;
pub mod connection;
pub mod constants;
pub mod error;
pub mod manager;
pub mod scanner;
pub mod signal;
pub mod simulated;
pub mod transfer;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use bluest_transport::BluestTransport;
pub use commands::OutboundMessage;
pub use connection::{AutoConnectOutcome, ConnectionSupervisor, RetryContext};
pub use constants::*; // Re-export all constants
pub use error::{LinkError, TransportError};
pub use manager::BadgeManager;
pub use scanner::{BluetoothScanner, ScanOutcome};
pub use simulated::{ReceivedFrame, RecordedWrite, SimulatedBadge, SimulatedTransport};
pub use transfer::{FrameTransport, SendReport};
pub use transport::{ScanStream, Transport};
pub use types::{
    AdapterState, ChannelCaps, CharacteristicInfo, ConnectionState, LinkStatus, PeripheralHandle,
    ServiceInfo, StatusIndicator, WritableChannel, WriteMode,
};
