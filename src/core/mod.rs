//! Core functionality for the badge link
//! The radio link to the badge and the bitmap pipeline feeding it.

pub mod bitmap;
pub mod bluetooth;

// Re-export commonly used types
pub use bitmap::ImageFrame;
pub use bluetooth::{BadgeManager, LinkError};
