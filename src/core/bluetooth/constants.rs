//! Constants used throughout the badge link
//! This module contains the default UUIDs, timeouts and transfer sizes.
//! Every value here is only a default: `LinkConfig` can override it.

use uuid::Uuid;

/// The UART-like service exposed by the badge firmware
pub const UUID_BADGE_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// The characteristic the badge reads commands from (UART RX on the badge side)
pub const UUID_BADGE_WRITE_CHAR: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Storage key for the last successfully connected peripheral
pub const LAST_DEVICE_STORAGE_KEY: &str = "last_connected_device_id";

/// Maximum number of connection retries after the first attempt
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// First backoff step in milliseconds
pub const BACKOFF_BASE_MS: u64 = 1000;

/// Upper bound for any backoff step in milliseconds
pub const BACKOFF_CAP_MS: u64 = 5000;

/// Timeout for a single connection attempt in milliseconds
pub const CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Timeout for the auto-connect scan in milliseconds
pub const SCAN_TIMEOUT_MS: u64 = 15_000;

/// Duration of a user-triggered discovery scan in milliseconds
pub const DISCOVERY_SCAN_MS: u64 = 15_000;

/// Delay before recovering from an unsolicited disconnect
pub const RECONNECT_DELAY_MS: u64 = 2000;

/// Delay before auto-connecting once the radio reports powered on
pub const POWER_ON_DELAY_MS: u64 = 500;

/// Signal strength poll interval
pub const RSSI_POLL_INTERVAL_MS: u64 = 5000;

/// Pause after the image header so the firmware can allocate its buffer
pub const IMAGE_SETTLE_DELAY_MS: u64 = 200;

/// Pause between two bitmap chunks
pub const CHUNK_DELAY_MS: u64 = 30;

/// Bytes of bitmap per chunk write
pub const CHUNK_SIZE: usize = 180;

/// Largest single write assumed when nothing larger was negotiated
pub const DEFAULT_MAX_WRITE_LEN: usize = 185;

/// Side of the square image area on the badge, in pixels
pub const BADGE_IMAGE_SIZE: u32 = 122;
