//! Defines shared data structures for the Bluetooth module.

use serde::Serialize;
use uuid::Uuid;

/// Represents a discovered or connected Bluetooth peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralHandle {
    /// Platform-assigned identifier (MAC address or platform UUID string)
    pub id: String,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// Last seen signal strength in dBm
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    /// Creates a new PeripheralHandle instance
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
        }
    }

    /// Name for log lines and prompts, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Power/authorization state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Unknown,
}

/// Write capabilities advertised by a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelCaps {
    pub notifiable: bool,
    pub writable_with_response: bool,
    pub writable_without_response: bool,
}

impl ChannelCaps {
    /// True when at least one write variant is supported.
    pub fn is_writable(&self) -> bool {
        self.writable_with_response || self.writable_without_response
    }

    /// The write variant to use; without-response is preferred.
    pub fn preferred_mode(&self) -> Option<WriteMode> {
        if self.writable_without_response {
            Some(WriteMode::WithoutResponse)
        } else if self.writable_with_response {
            Some(WriteMode::WithResponse)
        } else {
            None
        }
    }
}

/// GATT write variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// A characteristic as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub caps: ChannelCaps,
}

/// A service and its characteristics as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Handle to the characteristic used for outbound data.
///
/// Only valid for the connection it was acquired on: `epoch` identifies that
/// connection and a new channel must be acquired after every reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WritableChannel {
    pub device_id: String,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub caps: ChannelCaps,
    pub epoch: u64,
}

impl WritableChannel {
    /// Picks the characteristic matching `characteristic` that supports at
    /// least one write variant.
    pub fn select(
        device_id: &str,
        services: &[ServiceInfo],
        service: Uuid,
        characteristic: Uuid,
        epoch: u64,
    ) -> Option<Self> {
        services
            .iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == characteristic && c.caps.is_writable())
            .map(|c| Self {
                device_id: device_id.to_string(),
                service,
                characteristic,
                caps: c.caps,
                epoch,
            })
    }
}

/// The single logical connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting {
        attempt: u32,
    },
    Connected {
        handle: PeripheralHandle,
        channel: WritableChannel,
    },
    Disconnecting,
}

impl ConnectionState {
    /// True while a connection attempt is running or a connection is up.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting { .. } | ConnectionState::Connected { .. }
        )
    }

    pub fn connected_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Connected { handle, .. } => Some(&handle.id),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<&WritableChannel> {
        match self {
            ConnectionState::Connected { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

/// Snapshot of everything the link publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    /// Set once auto-connect has exhausted its retries
    pub autoconnect_failed: bool,
    /// Latest signal strength of the connected badge
    pub rssi: Option<i16>,
    /// Advisory flag, true while a send holds the channel
    pub sending: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            autoconnect_failed: false,
            rssi: None,
            sending: false,
        }
    }
}

/// The three states a connection indicator shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusIndicator {
    Disconnected,
    Connecting { retry: u32 },
    Connected { rssi: Option<i16> },
}

impl LinkStatus {
    pub fn indicator(&self) -> StatusIndicator {
        match &self.state {
            ConnectionState::Connecting { attempt } => StatusIndicator::Connecting { retry: *attempt },
            ConnectionState::Connected { .. } => StatusIndicator::Connected { rssi: self.rssi },
            _ => StatusIndicator::Disconnected,
        }
    }
}
