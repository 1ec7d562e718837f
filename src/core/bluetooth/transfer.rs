//! Framed transfer of outbound messages
//! A message goes out as one header write, then (for images) the bitmap in
//! bounded chunks, each awaited before the next.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::core::bluetooth::commands::OutboundMessage;
use crate::core::bluetooth::error::{LinkError, TransportError};
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::WritableChannel;

/// What a completed send did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Bitmap chunks written, not counting the header
    pub chunks: usize,
    /// Bytes written including the header
    pub bytes: usize,
    /// Set when a chunk failure forced the channel to be looked up again
    pub reacquired: Option<WritableChannel>,
}

/// Streams messages through a [`Transport`]
pub struct FrameTransport<T: Transport> {
    transport: Arc<T>,
    config: Arc<LinkConfig>,
}

impl<T: Transport> Clone for FrameTransport<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport> FrameTransport<T> {
    pub fn new(transport: Arc<T>, config: Arc<LinkConfig>) -> Self {
        Self { transport, config }
    }

    /// Sends `message` over `channel`.
    ///
    /// The header must fit in one write of `max_write_len` bytes, otherwise
    /// nothing is written and the send fails with `PayloadTooLarge`.
    /// Aborts with `Disconnected` as soon as the link is found down before a
    /// write. A failed chunk gets one retry on a freshly discovered channel;
    /// if that fails too the send ends with `ChunkSendFailed`. Nothing is
    /// resumed: callers restart the whole message.
    pub async fn send(
        &self,
        channel: &WritableChannel,
        message: &OutboundMessage,
    ) -> Result<SendReport, LinkError> {
        if !channel.caps.is_writable() {
            error!("Channel {} supports no write variant", channel.characteristic);
            return Err(LinkError::NotWritable);
        }

        let header = message.header()?;
        let limit = self.config.max_write_len;
        if header.len() > limit {
            error!("Header is {} bytes, write limit is {}", header.len(), limit);
            return Err(LinkError::PayloadTooLarge {
                len: header.len(),
                limit,
            });
        }
        self.ensure_connected(channel, 0).await?;
        debug!("Sending header ({} bytes)", header.len());
        self.transport
            .write(channel, &header)
            .await
            .map_err(|e| match e {
                TransportError::Disconnected => LinkError::Disconnected { offset: 0 },
                other => LinkError::WriteFailed(other),
            })?;

        let mut report = SendReport {
            chunks: 0,
            bytes: header.len(),
            reacquired: None,
        };
        let Some(body) = message.body() else {
            info!("Text sent to {}", channel.device_id);
            return Ok(report);
        };

        tokio::time::sleep(self.config.settle_delay()).await;

        let chunk_size = self.config.effective_chunk_size();
        let total = body.len().div_ceil(chunk_size);
        let mut current = channel.clone();

        for (index, chunk) in body.chunks(chunk_size).enumerate() {
            let offset = index * chunk_size;
            self.ensure_connected(&current, offset).await?;

            debug!("Sending chunk {}/{} ({} bytes at {})", index + 1, total, chunk.len(), offset);
            if let Err(e) = self.transport.write(&current, chunk).await {
                if e == TransportError::Disconnected {
                    warn!("Link dropped while writing chunk at {}", offset);
                    return Err(LinkError::Disconnected { offset });
                }
                warn!("Chunk at {} failed ({}), re-acquiring channel", offset, e);
                current = self
                    .reacquire(&current)
                    .await
                    .map_err(|source| LinkError::ChunkSendFailed { offset, source })?;
                self.transport
                    .write(&current, chunk)
                    .await
                    .map_err(|source| LinkError::ChunkSendFailed { offset, source })?;
                report.reacquired = Some(current.clone());
            }

            report.chunks += 1;
            report.bytes += chunk.len();
            if index + 1 < total {
                tokio::time::sleep(self.config.chunk_delay()).await;
            }
        }

        info!(
            "Image sent to {}: {} chunks, {} bytes",
            channel.device_id, report.chunks, report.bytes
        );
        Ok(report)
    }

    async fn ensure_connected(&self, channel: &WritableChannel, offset: usize) -> Result<(), LinkError> {
        if self.transport.is_connected(&channel.device_id).await {
            Ok(())
        } else {
            warn!("Device {} not connected at offset {}", channel.device_id, offset);
            Err(LinkError::Disconnected { offset })
        }
    }

    /// Rediscovers the service and picks the write characteristic again,
    /// keeping the connection epoch.
    async fn reacquire(&self, channel: &WritableChannel) -> Result<WritableChannel, TransportError> {
        let services = self
            .transport
            .discover_services(&channel.device_id, channel.service)
            .await?;
        WritableChannel::select(
            &channel.device_id,
            &services,
            channel.service,
            channel.characteristic,
            channel.epoch,
        )
        .ok_or(TransportError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_BADGE_SERVICE, UUID_BADGE_WRITE_CHAR};
    use crate::core::bluetooth::simulated::{SimulatedBadge, SimulatedTransport};
    use crate::core::bluetooth::types::ChannelCaps;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn setup(chunk_size: usize) -> (Arc<SimulatedTransport>, FrameTransport<SimulatedTransport>, WritableChannel) {
        let transport = Arc::new(SimulatedTransport::new(SimulatedBadge::new("badge", "Badge")));
        transport.connect("badge", Duration::from_secs(1)).await.unwrap();
        let config = Arc::new(LinkConfig {
            chunk_size,
            ..Default::default()
        });
        let channel = WritableChannel {
            device_id: "badge".into(),
            service: UUID_BADGE_SERVICE,
            characteristic: UUID_BADGE_WRITE_CHAR,
            caps: ChannelCaps {
                writable_without_response: true,
                ..Default::default()
            },
            epoch: 1,
        };
        (transport.clone(), FrameTransport::new(transport, config), channel)
    }

    fn image(len: usize) -> OutboundMessage {
        OutboundMessage::ImageUpdate {
            width: 8,
            height: len as u32,
            caption: None,
            bitmap: (0..len).map(|i| i as u8).collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_cover_bitmap() {
        for (len, chunk_size) in [(1, 180), (180, 180), (181, 180), (1861, 180), (10, 3)] {
            let (transport, frames, channel) = setup(chunk_size).await;
            let message = image(len);
            let report = frames.send(&channel, &message).await.unwrap();

            let writes = transport.writes();
            assert_eq!(writes.len(), 1 + len.div_ceil(chunk_size));
            assert_eq!(report.chunks, len.div_ceil(chunk_size));
            assert!(writes[1..].iter().all(|w| w.data.len() <= chunk_size));
            let sent: Vec<u8> = writes[1..].iter().flat_map(|w| w.data.clone()).collect();
            assert_eq!(sent, message.body().unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing() {
        let (_, frames, channel) = setup(180).await;
        let started = tokio::time::Instant::now();
        frames.send(&channel, &image(540)).await.unwrap();
        // Settle delay plus two gaps between three chunks
        assert_eq!(started.elapsed(), Duration::from_millis(200 + 2 * 30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_writable() {
        let (transport, frames, mut channel) = setup(180).await;
        channel.caps = ChannelCaps {
            notifiable: true,
            ..Default::default()
        };
        let message = OutboundMessage::text("Hi", "#00FF00").unwrap();
        assert!(matches!(
            frames.send(&channel, &message).await,
            Err(LinkError::NotWritable)
        ));
        assert!(transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_retried_once() {
        let (transport, frames, channel) = setup(4).await;
        // Index 2 is the second chunk
        transport.fail_write(2);
        let message = image(12);
        let report = frames.send(&channel, &message).await.unwrap();

        assert_eq!(report.chunks, 3);
        assert_eq!(report.reacquired.as_ref().map(|c| c.epoch), Some(1));
        assert_eq!(transport.discoveries(), 1);
        let sent: Vec<u8> = transport.writes()[1..].iter().flat_map(|w| w.data.clone()).collect();
        assert_eq!(sent, message.body().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_fails_after_retry() {
        let (transport, frames, channel) = setup(4).await;
        transport.fail_write(2);
        transport.fail_write(3);
        let result = frames.send(&channel, &image(12)).await;
        assert!(matches!(
            result,
            Err(LinkError::ChunkSendFailed { offset: 4, source: TransportError::WriteFailed(_) })
        ));
        // Header and first chunk only; nothing after the failed chunk
        assert_eq!(transport.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_fails_when_characteristic_gone() {
        let (transport, frames, channel) = setup(4).await;
        transport.fail_write(1);
        transport.set_services(Vec::new());
        let result = frames.send(&channel, &image(12)).await;
        assert!(matches!(
            result,
            Err(LinkError::ChunkSendFailed { offset: 0, source: TransportError::NotFound })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_header_not_written() {
        let (transport, frames, channel) = setup(180).await;
        let message = OutboundMessage::text("x".repeat(300), "#FFFFFF").unwrap();
        assert!(matches!(
            frames.send(&channel, &message).await,
            Err(LinkError::PayloadTooLarge { len: 330, limit: 185 })
        ));
        assert!(transport.writes().is_empty());

        // Exactly at the limit still goes out; the text header adds 30 bytes
        let text = "x".repeat(185 - 30);
        let message = OutboundMessage::text(text, "#FFFFFF").unwrap();
        frames.send(&channel, &message).await.unwrap();
        assert_eq!(transport.writes().len(), 1);
        assert_eq!(transport.writes()[0].data.len(), 185);
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_failure() {
        let (transport, frames, channel) = setup(180).await;
        transport.fail_write(0);
        let message = OutboundMessage::text("Hi", "#00FF00").unwrap();
        assert!(matches!(
            frames.send(&channel, &message).await,
            Err(LinkError::WriteFailed(_))
        ));
    }
}
