//! Badge link library
//! Discovers an e-ink badge over Bluetooth LE, keeps a supervised connection
//! to it and pushes text and 1-bit images through a chunked wire protocol.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod storage;
pub mod utils;

#[cfg(feature = "tauri")]
pub mod commands;

pub use config::LinkConfig;
pub use core::bluetooth::{BadgeManager, LinkError, LinkStatus, Transport};
pub use state::AppState;
