use crate::core::bluetooth::constants::*;
use crate::utils::ensure_directory_exists;
use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use uuid::Uuid;

pub const CONFIG_FILE_NAME: &str = "link_config.json";

/// Tunables for discovery, connection supervision and transfer pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// UART service advertised by the badge
    pub service_uuid: Uuid,
    /// Characteristic commands are written to
    pub write_characteristic_uuid: Uuid,
    /// Badge to auto-connect to. When unset the last connected badge is used.
    pub preferred_device: Option<String>,

    /// Retries after the first auto-connect attempt
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,

    pub connect_timeout_ms: u64,
    /// Scan window used by auto-connect
    pub scan_timeout_ms: u64,
    /// Duration of a user-triggered discovery scan
    pub discovery_scan_ms: u64,
    /// Delay between an unsolicited disconnect and the recovery attempt
    pub reconnect_delay_ms: u64,
    /// Delay between the radio powering on and auto-connect
    pub power_on_delay_ms: u64,
    pub rssi_interval_ms: u64,

    /// Pause after an image header before the bitmap follows
    pub settle_delay_ms: u64,
    /// Pause between bitmap chunks
    pub chunk_delay_ms: u64,
    /// Bitmap bytes per chunk, never above `max_write_len`
    pub chunk_size: usize,
    /// Largest single write the link accepts
    pub max_write_len: usize,

    /// Side of the square image area on the badge
    pub image_size: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            service_uuid: UUID_BADGE_SERVICE,
            write_characteristic_uuid: UUID_BADGE_WRITE_CHAR,
            preferred_device: None,
            max_retries: MAX_CONNECT_RETRIES,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_cap_ms: BACKOFF_CAP_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            scan_timeout_ms: SCAN_TIMEOUT_MS,
            discovery_scan_ms: DISCOVERY_SCAN_MS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            power_on_delay_ms: POWER_ON_DELAY_MS,
            rssi_interval_ms: RSSI_POLL_INTERVAL_MS,
            settle_delay_ms: IMAGE_SETTLE_DELAY_MS,
            chunk_delay_ms: CHUNK_DELAY_MS,
            chunk_size: CHUNK_SIZE,
            max_write_len: DEFAULT_MAX_WRITE_LEN,
            image_size: BADGE_IMAGE_SIZE,
        }
    }
}

impl LinkConfig {
    /// Loads the config from `path`, falling back to defaults when the file is missing.
    pub async fn load_config(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("parsing {}", path.display()))?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the config to `path`, creating parent directories as needed.
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            ensure_directory_exists(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize link config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;

        info!("Link config saved to {:?}.", path);
        Ok(())
    }

    /// Backoff before retry `attempt`: `min(base * 2^(attempt-1), cap)`, zero for the first try.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }

    /// Chunk size actually used, kept within `1..=max_write_len`.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, self.max_write_len.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn discovery_scan(&self) -> Duration {
        Duration::from_millis(self.discovery_scan_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn power_on_delay(&self) -> Duration {
        Duration::from_millis(self.power_on_delay_ms)
    }

    pub fn rssi_interval(&self) -> Duration {
        Duration::from_millis(self.rssi_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}
