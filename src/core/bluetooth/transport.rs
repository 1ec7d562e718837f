//! Radio transport contract
//! Everything the link needs from the platform Bluetooth stack. Implementations
//! report every failure verbatim and never retry on their own.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::types::{AdapterState, PeripheralHandle, ServiceInfo, WritableChannel};

/// Stream of scan results. Dropping it stops the scan.
pub type ScanStream = BoxStream<'static, Result<PeripheralHandle, TransportError>>;

/// Platform radio abstraction
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Current radio power state
    async fn adapter_state(&self) -> AdapterState;

    /// Radio power state changes. With `emit_current` the present state is
    /// yielded first.
    fn adapter_events(&self, emit_current: bool) -> BoxStream<'static, AdapterState>;

    /// Identifiers of peripherals that dropped. Yields once per physical
    /// disconnect.
    fn disconnect_events(&self) -> BoxStream<'static, String>;

    /// Starts a scan, optionally limited to peripherals advertising `service_filter`.
    async fn scan(&self, service_filter: Option<Uuid>) -> Result<ScanStream, TransportError>;

    /// Connects to the peripheral with the given identifier.
    async fn connect(&self, id: &str, timeout: Duration) -> Result<PeripheralHandle, TransportError>;

    /// Tears down the low-level connection. Not an error when already gone.
    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError>;

    async fn is_connected(&self, id: &str) -> bool;

    /// Discovers `service` and its characteristics on a connected peripheral.
    async fn discover_services(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Vec<ServiceInfo>, TransportError>;

    /// One atomic write of at most the negotiated payload size.
    async fn write(&self, channel: &WritableChannel, data: &[u8]) -> Result<(), TransportError>;

    /// Signal strength in dBm. `None` on any failure.
    async fn read_signal_strength(&self, id: &str) -> Option<i16>;
}

/// Turns a broadcast receiver into a stream, skipping over lagged items.
pub fn broadcast_stream<T: Clone + Send + 'static>(
    receiver: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    Box::pin(stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(value) => return Some((value, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event stream lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

/// Polls `stream` until an item satisfies `wanted`. `None` when the stream
/// ends or `deadline` passes first.
pub async fn first_match<S, F>(stream: S, deadline: Instant, mut wanted: F) -> Option<S::Item>
where
    S: Stream,
    F: FnMut(&S::Item) -> bool,
{
    let search = async {
        let mut stream = std::pin::pin!(stream);
        while let Some(item) = stream.next().await {
            if wanted(&item) {
                return Some(item);
            }
        }
        None
    };
    tokio::time::timeout_at(deadline, search).await.ok().flatten()
}
