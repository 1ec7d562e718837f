//! In-memory badge
//! A [`Transport`] that plays the part of the radio and a single badge. It
//! records every connection attempt and write, reassembles what the badge
//! would have received, and can be told to misbehave. The CLI uses it for
//! `--simulate` runs; the tests use it for fault injection.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, info};
use serde::Deserialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_MAX_WRITE_LEN, UUID_BADGE_SERVICE, UUID_BADGE_WRITE_CHAR,
};
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::{ScanStream, Transport, broadcast_stream};
use crate::core::bluetooth::types::{
    AdapterState, ChannelCaps, CharacteristicInfo, PeripheralHandle, ServiceInfo, WritableChannel,
};

/// The simulated peripheral
#[derive(Debug, Clone)]
pub struct SimulatedBadge {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
    /// GATT table returned by service discovery
    pub services: Vec<ServiceInfo>,
}

impl SimulatedBadge {
    /// A badge exposing the default UART service with a writable RX characteristic.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            rssi: -58,
            services: vec![ServiceInfo {
                uuid: UUID_BADGE_SERVICE,
                characteristics: vec![CharacteristicInfo {
                    uuid: UUID_BADGE_WRITE_CHAR,
                    caps: ChannelCaps {
                        notifiable: false,
                        writable_with_response: true,
                        writable_without_response: true,
                    },
                }],
            }],
        }
    }

    fn handle(&self) -> PeripheralHandle {
        PeripheralHandle::new(self.id.clone(), self.name.clone(), Some(self.rssi))
    }
}

/// A write as the badge saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

/// A complete command reassembled from the recorded writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedFrame {
    Text {
        text: String,
        color: String,
    },
    Image {
        width: u32,
        height: u32,
        prompt: Option<String>,
        bitmap: Vec<u8>,
    },
}

#[derive(Deserialize)]
struct Header {
    cmd: Option<String>,
    text: Option<String>,
    color: Option<String>,
    w: Option<u32>,
    h: Option<u32>,
    len: Option<usize>,
    prompt: Option<String>,
}

#[derive(Debug)]
struct SimState {
    adapter_state: AdapterState,
    badge: SimulatedBadge,
    /// Whether the badge answers connects and shows up in scans
    reachable: bool,
    /// Other advertisers that show up in unfiltered scans
    bystanders: Vec<PeripheralHandle>,
    /// Scripted results for upcoming connect calls, consumed front first
    connect_script: VecDeque<TransportError>,
    connect_delay: Duration,
    filtered_scan_fails: bool,
    failing_writes: HashSet<usize>,
    drop_after_writes: Option<usize>,
    /// Largest write the badge accepts
    max_write_len: usize,
    connected: HashSet<String>,

    connect_attempts: Vec<String>,
    scans: Vec<Option<Uuid>>,
    cancels: Vec<String>,
    discoveries: usize,
    write_attempts: usize,
    writes: Vec<RecordedWrite>,
}

/// Simulated radio with one badge in range
#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
    disconnects: broadcast::Sender<String>,
    adapter_tx: broadcast::Sender<AdapterState>,
}

impl SimulatedTransport {
    pub fn new(badge: SimulatedBadge) -> Self {
        let (disconnects, _) = broadcast::channel(16);
        let (adapter_tx, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(SimState {
                adapter_state: AdapterState::PoweredOn,
                badge,
                reachable: true,
                bystanders: Vec::new(),
                connect_script: VecDeque::new(),
                connect_delay: Duration::ZERO,
                filtered_scan_fails: false,
                failing_writes: HashSet::new(),
                drop_after_writes: None,
                max_write_len: DEFAULT_MAX_WRITE_LEN,
                connected: HashSet::new(),
                connect_attempts: Vec::new(),
                scans: Vec::new(),
                cancels: Vec::new(),
                discoveries: 0,
                write_attempts: 0,
                writes: Vec::new(),
            })),
            disconnects,
            adapter_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock only happens inside a failing test
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn badge_id(&self) -> String {
        self.lock().badge.id.clone()
    }

    /// Makes the badge reachable or out of range.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Queues failures for the next connect calls.
    pub fn script_connect_failures(&self, failures: impl IntoIterator<Item = TransportError>) {
        self.lock().connect_script.extend(failures);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn set_filtered_scan_fails(&self, fails: bool) {
        self.lock().filtered_scan_fails = fails;
    }

    pub fn add_bystander(&self, handle: PeripheralHandle) {
        self.lock().bystanders.push(handle);
    }

    /// Replaces the GATT table returned by discovery.
    pub fn set_services(&self, services: Vec<ServiceInfo>) {
        self.lock().badge.services = services;
    }

    pub fn set_rssi(&self, rssi: i16) {
        self.lock().badge.rssi = rssi;
    }

    /// Makes the write with the given index (0-based, counting every
    /// attempt) fail once.
    pub fn fail_write(&self, index: usize) {
        self.lock().failing_writes.insert(index);
    }

    /// Drops the link after `count` successful writes.
    pub fn drop_after_writes(&self, count: usize) {
        self.lock().drop_after_writes = Some(count);
    }

    /// Writes longer than `len` fail instead of reaching the badge.
    pub fn set_max_write_len(&self, len: usize) {
        self.lock().max_write_len = len;
    }

    /// Simulates the badge going away on its own.
    pub fn drop_link(&self) {
        let id = {
            let mut state = self.lock();
            let id = state.badge.id.clone();
            if !state.connected.remove(&id) {
                return;
            }
            id
        };
        info!("Simulated badge {} dropped the link", id);
        let _ = self.disconnects.send(id);
    }

    pub fn set_adapter_state(&self, adapter_state: AdapterState) {
        self.lock().adapter_state = adapter_state;
        let _ = self.adapter_tx.send(adapter_state);
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts.len()
    }

    pub fn scans(&self) -> Vec<Option<Uuid>> {
        self.lock().scans.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancels.clone()
    }

    pub fn discoveries(&self) -> usize {
        self.lock().discoveries
    }

    /// Successful writes in the order they arrived
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Reassembles complete commands from the recorded writes. An image whose
    /// bitmap never fully arrived is not reported.
    pub fn frames(&self) -> Vec<ReceivedFrame> {
        let writes = self.writes();
        let mut frames = Vec::new();
        let mut iter = writes.iter().peekable();

        while let Some(write) = iter.next() {
            let Ok(header) = serde_json::from_slice::<Header>(&write.data) else {
                debug!("Simulated badge ignoring stray {} byte write", write.data.len());
                continue;
            };

            match header.cmd.as_deref() {
                Some("image_start") => {
                    let (Some(width), Some(height), Some(len)) = (header.w, header.h, header.len)
                    else {
                        continue;
                    };
                    let mut bitmap = Vec::with_capacity(len);
                    while bitmap.len() < len {
                        match iter.peek() {
                            Some(next) if serde_json::from_slice::<Header>(&next.data).is_err() => {
                                bitmap.extend_from_slice(&next.data);
                                iter.next();
                            }
                            _ => break,
                        }
                    }
                    if bitmap.len() == len {
                        frames.push(ReceivedFrame::Image {
                            width,
                            height,
                            prompt: header.prompt,
                            bitmap,
                        });
                    }
                }
                None => {
                    if let (Some(text), Some(color)) = (header.text, header.color) {
                        frames.push(ReceivedFrame::Text { text, color });
                    }
                }
                Some(other) => debug!("Simulated badge ignoring command {:?}", other),
            }
        }

        frames
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn adapter_state(&self) -> AdapterState {
        self.lock().adapter_state
    }

    fn adapter_events(&self, emit_current: bool) -> BoxStream<'static, AdapterState> {
        let receiver = self.adapter_tx.subscribe();
        let current = emit_current.then(|| self.lock().adapter_state);
        Box::pin(stream::iter(current).chain(broadcast_stream(receiver)))
    }

    fn disconnect_events(&self) -> BoxStream<'static, String> {
        broadcast_stream(self.disconnects.subscribe())
    }

    async fn scan(&self, service_filter: Option<Uuid>) -> Result<ScanStream, TransportError> {
        let mut state = self.lock();
        state.scans.push(service_filter);

        if state.adapter_state != AdapterState::PoweredOn {
            return Err(TransportError::Scan(format!("adapter {:?}", state.adapter_state)));
        }
        if service_filter.is_some() && state.filtered_scan_fails {
            return Err(TransportError::Scan("service filter not supported".into()));
        }

        let mut results: Vec<Result<PeripheralHandle, TransportError>> = Vec::new();
        if service_filter.is_none() {
            results.extend(state.bystanders.iter().cloned().map(Ok));
        }
        let advertises = service_filter
            .is_none_or(|service| state.badge.services.iter().any(|s| s.uuid == service));
        if state.reachable && advertises {
            results.push(Ok(state.badge.handle()));
        }

        // A real scan keeps running until it is dropped
        Ok(Box::pin(stream::iter(results).chain(stream::pending())))
    }

    async fn connect(&self, id: &str, timeout: Duration) -> Result<PeripheralHandle, TransportError> {
        let (scripted, delay) = {
            let mut state = self.lock();
            state.connect_attempts.push(id.to_string());
            (state.connect_script.pop_front(), state.connect_delay)
        };

        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = scripted {
            return Err(error);
        }

        let mut state = self.lock();
        if state.badge.id != id || !state.reachable {
            return Err(TransportError::NotFound);
        }
        state.connected.insert(id.to_string());
        Ok(state.badge.handle())
    }

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError> {
        let was_connected = {
            let mut state = self.lock();
            state.cancels.push(id.to_string());
            state.connected.remove(id)
        };
        if was_connected {
            let _ = self.disconnects.send(id.to_string());
        }
        Ok(())
    }

    async fn is_connected(&self, id: &str) -> bool {
        self.lock().connected.contains(id)
    }

    async fn discover_services(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Vec<ServiceInfo>, TransportError> {
        let mut state = self.lock();
        state.discoveries += 1;
        if !state.connected.contains(id) {
            return Err(TransportError::Disconnected);
        }
        Ok(state
            .badge
            .services
            .iter()
            .filter(|s| s.uuid == service)
            .cloned()
            .collect())
    }

    async fn write(&self, channel: &WritableChannel, data: &[u8]) -> Result<(), TransportError> {
        let dropped = {
            let mut state = self.lock();
            let index = state.write_attempts;
            state.write_attempts += 1;

            if !state.connected.contains(&channel.device_id) {
                return Err(TransportError::Disconnected);
            }
            if data.len() > state.max_write_len {
                return Err(TransportError::WriteFailed(format!(
                    "{} byte write exceeds the {} byte limit",
                    data.len(),
                    state.max_write_len
                )));
            }
            if state.failing_writes.remove(&index) {
                return Err(TransportError::WriteFailed(format!("injected failure at write {}", index)));
            }

            state.writes.push(RecordedWrite {
                characteristic: channel.characteristic,
                data: data.to_vec(),
            });

            let dropped = state
                .drop_after_writes
                .is_some_and(|limit| state.writes.len() >= limit);
            if dropped {
                state.drop_after_writes = None;
                state.connected.remove(&channel.device_id);
            }
            dropped
        };

        if dropped {
            info!("Simulated badge {} dropped the link mid-transfer", channel.device_id);
            let _ = self.disconnects.send(channel.device_id.clone());
        }
        Ok(())
    }

    async fn read_signal_strength(&self, id: &str) -> Option<i16> {
        let state = self.lock();
        state.connected.contains(id).then_some(state.badge.rssi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn channel(transport: &SimulatedTransport) -> WritableChannel {
        WritableChannel {
            device_id: transport.badge_id(),
            service: UUID_BADGE_SERVICE,
            characteristic: UUID_BADGE_WRITE_CHAR,
            caps: ChannelCaps {
                writable_without_response: true,
                ..Default::default()
            },
            epoch: 1,
        }
    }

    #[tokio::test]
    async fn test_reassembles_frames() {
        let transport = SimulatedTransport::new(SimulatedBadge::new("badge", "Badge"));
        transport.connect("badge", Duration::from_secs(1)).await.unwrap();
        let channel = channel(&transport);

        transport
            .write(&channel, b"{\"text\":\"Hi\",\"color\":\"#00FF00\"}\n")
            .await
            .unwrap();
        transport
            .write(&channel, b"{\"cmd\":\"image_start\",\"w\":4,\"h\":4,\"len\":3}\n")
            .await
            .unwrap();
        transport.write(&channel, &[0xAA, 0x55]).await.unwrap();
        transport.write(&channel, &[0x0F]).await.unwrap();

        assert_eq!(
            transport.frames(),
            vec![
                ReceivedFrame::Text {
                    text: "Hi".into(),
                    color: "#00FF00".into()
                },
                ReceivedFrame::Image {
                    width: 4,
                    height: 4,
                    prompt: None,
                    bitmap: vec![0xAA, 0x55, 0x0F]
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_incomplete_image_not_reported() {
        let transport = SimulatedTransport::new(SimulatedBadge::new("badge", "Badge"));
        transport.connect("badge", Duration::from_secs(1)).await.unwrap();
        let channel = channel(&transport);

        transport
            .write(&channel, b"{\"cmd\":\"image_start\",\"w\":8,\"h\":8,\"len\":8}\n")
            .await
            .unwrap();
        transport.write(&channel, &[0xFF; 4]).await.unwrap();
        assert!(transport.frames().is_empty());
    }

    #[tokio::test]
    async fn test_connect_script_and_timeout() {
        let transport = SimulatedTransport::new(SimulatedBadge::new("badge", "Badge"));
        transport.script_connect_failures([TransportError::Disconnected]);
        assert_eq!(
            transport.connect("badge", Duration::from_secs(1)).await,
            Err(TransportError::Disconnected)
        );
        assert_eq!(
            transport.connect("other", Duration::from_secs(1)).await,
            Err(TransportError::NotFound)
        );
        assert!(transport.connect("badge", Duration::from_secs(1)).await.is_ok());
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_times_out() {
        let transport = SimulatedTransport::new(SimulatedBadge::new("badge", "Badge"));
        transport.set_connect_delay(Duration::from_secs(30));
        assert_eq!(
            transport.connect("badge", Duration::from_secs(15)).await,
            Err(TransportError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let transport = SimulatedTransport::new(SimulatedBadge::new("badge", "Badge"));
        transport.connect("badge", Duration::from_secs(1)).await.unwrap();
        let channel = channel(&transport);

        assert!(matches!(
            transport.write(&channel, &[0; 186]).await,
            Err(TransportError::WriteFailed(_))
        ));
        transport.write(&channel, &[0; 185]).await.unwrap();

        transport.set_max_write_len(512);
        transport.write(&channel, &[0; 373]).await.unwrap();
        assert_eq!(transport.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_drop_after_writes_emits_disconnect() {
        let transport = SimulatedTransport::new(SimulatedBadge::new("badge", "Badge"));
        let mut events = transport.disconnect_events();
        transport.connect("badge", Duration::from_secs(1)).await.unwrap();
        transport.drop_after_writes(1);

        let channel = channel(&transport);
        transport.write(&channel, &[1]).await.unwrap();
        assert!(!transport.is_connected("badge").await);
        assert_eq!(events.next().await.as_deref(), Some("badge"));
        assert_eq!(
            transport.write(&channel, &[2]).await,
            Err(TransportError::Disconnected)
        );
    }
}
