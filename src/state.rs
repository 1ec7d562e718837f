//! Application state management
//! This module builds the badge manager from configuration on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::config::LinkConfig;
use crate::core::bluetooth::{BadgeManager, BluestTransport, Transport};
use crate::storage::{JsonFileStore, KeyValueStore};

/// Global application state
pub struct AppState<T: Transport = BluestTransport> {
    /// The badge manager instance
    pub manager: BadgeManager<T>,
    /// The radio the manager runs on
    pub transport: Arc<T>,
    /// Where the link config was read from
    pub config_path: PathBuf,
}

impl AppState<BluestTransport> {
    /// Opens the system Bluetooth adapter and builds the manager.
    pub async fn new(config_path: &Path, store_path: &Path) -> Result<Self> {
        info!("Initializing Bluetooth transport...");
        let transport = BluestTransport::new()
            .await
            .context("opening the Bluetooth adapter")?;
        Self::with_transport(Arc::new(transport), config_path, store_path).await
    }
}

impl<T: Transport> AppState<T> {
    /// Builds the manager on top of an existing transport.
    pub async fn with_transport(
        transport: Arc<T>,
        config_path: &Path,
        store_path: &Path,
    ) -> Result<Self> {
        let config = LinkConfig::load_config(config_path).await?;
        let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(store_path));
        info!("Initializing BadgeManager...");
        Ok(Self {
            manager: BadgeManager::new(transport.clone(), config, store),
            transport,
            config_path: config_path.to_path_buf(),
        })
    }

    /// Gets a handle to the badge manager
    pub fn manager(&self) -> BadgeManager<T> {
        self.manager.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::{SimulatedBadge, SimulatedTransport};

    #[tokio::test]
    async fn test_state_uses_config_on_disk() {
        let dir = std::env::temp_dir().join(format!("badge-link-state-{}", std::process::id()));
        let config_path = dir.join("link_config.json");
        LinkConfig {
            chunk_size: 64,
            ..Default::default()
        }
        .save_config(&config_path)
        .await
        .unwrap();

        let transport = Arc::new(SimulatedTransport::new(SimulatedBadge::new("badge", "Badge")));
        let state = AppState::with_transport(transport, &config_path, &dir.join("store.json"))
            .await
            .unwrap();
        assert_eq!(state.manager().config().chunk_size, 64);
        assert_eq!(state.config_path, config_path);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
