//! Badge manager
//! This module provides the main interface for badge operations: connection
//! state, the discovered device list, and sending text or images.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use log::{error, info};
use tokio::sync::{Mutex, watch};

use crate::config::LinkConfig;
use crate::core::bitmap::{self, ImageFrame};
use crate::core::bluetooth::commands::OutboundMessage;
use crate::core::bluetooth::connection::{AutoConnectOutcome, ConnectionSupervisor};
use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::transfer::{FrameTransport, SendReport};
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{LinkStatus, PeripheralHandle};
use crate::storage::KeyValueStore;

/// Clears the published `sending` flag when a send ends, however it ends.
struct SendingFlag<'a, T: Transport> {
    supervisor: &'a ConnectionSupervisor<T>,
}

impl<'a, T: Transport> SendingFlag<'a, T> {
    fn raise(supervisor: &'a ConnectionSupervisor<T>) -> Self {
        supervisor.update(|status| {
            status.sending = true;
            true
        });
        Self { supervisor }
    }
}

impl<T: Transport> Drop for SendingFlag<'_, T> {
    fn drop(&mut self) {
        self.supervisor.update(|status| {
            status.sending = false;
            true
        });
    }
}

/// Single entry point for everything badge related
pub struct BadgeManager<T: Transport> {
    supervisor: ConnectionSupervisor<T>,
    frames: FrameTransport<T>,
    config: Arc<LinkConfig>,
    /// Held for the whole of a send
    send_lock: Arc<Mutex<()>>,
}

impl<T: Transport> Clone for BadgeManager<T> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            frames: self.frames.clone(),
            config: self.config.clone(),
            send_lock: self.send_lock.clone(),
        }
    }
}

impl<T: Transport> BadgeManager<T> {
    /// Creates a new BadgeManager. Nothing runs until [`start`](Self::start).
    pub fn new(transport: Arc<T>, config: LinkConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let config = Arc::new(config);
        Self {
            supervisor: ConnectionSupervisor::new(transport.clone(), config.clone(), store),
            frames: FrameTransport::new(transport, config.clone()),
            config,
            send_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Starts following disconnects and radio power changes. Auto-connect
    /// runs once the radio reports powered on.
    pub fn start(&self) {
        info!("Starting badge manager");
        self.supervisor.start();
    }

    pub fn shutdown(&self) {
        info!("Shutting down badge manager");
        self.supervisor.shutdown();
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<T> {
        &self.supervisor
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn status(&self) -> LinkStatus {
        self.supervisor.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.supervisor.subscribe()
    }

    /// Discovered peripherals, strongest signal first
    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.supervisor.scanner().devices()
    }

    pub fn device_events(&self) -> BoxStream<'static, PeripheralHandle> {
        self.supervisor.scanner().device_events()
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.channel().is_some()
    }

    pub async fn start_scan(&self) -> Result<(), LinkError> {
        self.supervisor.start_scan().await
    }

    pub fn stop_scan(&self) {
        self.supervisor.stop_scan();
    }

    /// Scans for the full discovery window and returns what was found.
    pub async fn discover(&self) -> Result<Vec<PeripheralHandle>, LinkError> {
        self.supervisor.discover().await
    }

    /// Connects to a device with the given ID
    pub async fn connect_to_device(&self, device_id: &str) -> Result<PeripheralHandle, LinkError> {
        self.supervisor.connect_manual(device_id).await
    }

    pub async fn auto_connect(&self) -> AutoConnectOutcome {
        self.supervisor.auto_connect().await
    }

    /// Disconnects from the currently connected badge
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.supervisor.disconnect().await
    }

    /// Shows `text` on the badge in `color` (`#RRGGBB`).
    pub async fn send_text(&self, text: &str, color: &str) -> Result<SendReport, LinkError> {
        let message = OutboundMessage::text(text, color)?;
        self.send(message).await
    }

    /// Decodes `image`, fits it to the badge's image area and sends it with
    /// an optional caption.
    pub async fn send_image(&self, image: &[u8], caption: &str) -> Result<SendReport, LinkError> {
        let frame = self.prepare_image(image).await?;
        let message = OutboundMessage::image(frame, caption);
        self.send(message).await
    }

    /// Runs decode, crop and the bitmap pipeline off the async threads.
    pub async fn prepare_image(&self, image: &[u8]) -> Result<ImageFrame, LinkError> {
        let bytes = image.to_vec();
        let size = self.config.image_size;
        tokio::task::spawn_blocking(move || {
            let raster = bitmap::decode_for_badge(&bytes, size)?;
            bitmap::render(&raster, size, size)
        })
        .await
        .map_err(|e| LinkError::Image(format!("image task failed: {}", e)))?
    }

    async fn send(&self, message: OutboundMessage) -> Result<SendReport, LinkError> {
        let _guard = self.send_lock.try_lock().map_err(|_| LinkError::Busy)?;
        let channel = self.supervisor.channel().ok_or(LinkError::NotConnected)?;

        let _sending = SendingFlag::raise(&self.supervisor);
        let report = self.frames.send(&channel, &message).await.inspect_err(|e| {
            error!("Send to {} failed: {}", channel.device_id, e);
        })?;

        if let Some(fresh) = &report.reacquired {
            self.supervisor.refresh_channel(fresh.clone());
        }
        Ok(report)
    }
}
