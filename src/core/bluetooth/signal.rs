//! Signal strength polling for the connected badge

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::LinkStatus;

/// Reads the RSSI of `device_id` right away and then every `interval`.
///
/// Only the `rssi` field of the published status is touched, and only while
/// that device is still the connected one. The task ends when the transport
/// reports the device gone or `token` is cancelled.
pub fn spawn_signal_poll<T: Transport>(
    transport: Arc<T>,
    status: Arc<watch::Sender<LinkStatus>>,
    device_id: String,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting signal strength polling for {}", device_id);
        loop {
            if token.is_cancelled() {
                break;
            }
            if !transport.is_connected(&device_id).await {
                info!("Device {} is not connected, stopping signal polling", device_id);
                break;
            }

            if let Some(rssi) = transport.read_signal_strength(&device_id).await {
                status.send_if_modified(|current| {
                    if current.state.connected_id() != Some(device_id.as_str())
                        || current.rssi == Some(rssi)
                    {
                        return false;
                    }
                    debug!("RSSI for {}: {} dBm", device_id, rssi);
                    current.rssi = Some(rssi);
                    true
                });
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Signal polling for {} finished", device_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::simulated::{SimulatedBadge, SimulatedTransport};
    use crate::core::bluetooth::types::{
        ChannelCaps, ConnectionState, PeripheralHandle, WritableChannel,
    };
    use uuid::Uuid;

    fn connected_status(id: &str) -> LinkStatus {
        LinkStatus {
            state: ConnectionState::Connected {
                handle: PeripheralHandle::new(id, None, None),
                channel: WritableChannel {
                    device_id: id.to_string(),
                    service: Uuid::nil(),
                    characteristic: Uuid::nil(),
                    caps: ChannelCaps::default(),
                    epoch: 1,
                },
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_disconnected() {
        let transport = Arc::new(SimulatedTransport::new(SimulatedBadge::new("badge", "Badge")));
        transport.connect("badge", Duration::from_secs(1)).await.unwrap();
        let status = Arc::new(watch::channel(connected_status("badge")).0);

        let task = spawn_signal_poll(
            transport.clone(),
            status.clone(),
            "badge".into(),
            Duration::from_secs(5),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status.borrow().rssi, Some(-58));

        transport.set_rssi(-71);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(status.borrow().rssi, Some(-71));

        transport.drop_link();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let transport = Arc::new(SimulatedTransport::new(SimulatedBadge::new("badge", "Badge")));
        transport.connect("badge", Duration::from_secs(1)).await.unwrap();
        let status = Arc::new(watch::channel(connected_status("badge")).0);
        let token = CancellationToken::new();

        let task = spawn_signal_poll(
            transport,
            status,
            "badge".into(),
            Duration::from_secs(5),
            token.clone(),
        );
        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_other_device() {
        let transport = Arc::new(SimulatedTransport::new(SimulatedBadge::new("badge", "Badge")));
        transport.connect("badge", Duration::from_secs(1)).await.unwrap();
        let status = Arc::new(watch::channel(connected_status("someone-else")).0);

        let token = CancellationToken::new();
        let _task = spawn_signal_poll(
            transport,
            status.clone(),
            "badge".into(),
            Duration::from_secs(5),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status.borrow().rssi, None);
        token.cancel();
    }
}
