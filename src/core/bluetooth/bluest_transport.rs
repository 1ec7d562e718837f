//! Platform radio adapter built on bluest
//! Wraps the host Bluetooth stack behind the [`Transport`] contract. Device and
//! characteristic objects stay cached here; everything above only sees ids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, AdapterEvent, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::{ScanStream, Transport, broadcast_stream, first_match};
use crate::core::bluetooth::types::{
    AdapterState, ChannelCaps, CharacteristicInfo, PeripheralHandle, ServiceInfo, WritableChannel,
};

impl From<bluest::Error> for TransportError {
    fn from(error: bluest::Error) -> Self {
        match error.kind() {
            ErrorKind::Timeout => TransportError::Timeout,
            ErrorKind::NotFound => TransportError::NotFound,
            ErrorKind::NotConnected => TransportError::Disconnected,
            ErrorKind::NotAuthorized => TransportError::Unauthorized,
            _ => TransportError::Other(error.to_string()),
        }
    }
}

/// Host Bluetooth stack
pub struct BluestTransport {
    adapter: Adapter,
    /// Devices seen by scans, keyed by id
    devices: Arc<Mutex<HashMap<String, Device>>>,
    /// Characteristics found by the last discovery on each device
    characteristics: Arc<Mutex<HashMap<(String, Uuid), Characteristic>>>,
    adapter_state: Arc<Mutex<AdapterState>>,
    adapter_tx: broadcast::Sender<AdapterState>,
    disconnects: broadcast::Sender<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BluestTransport {
    /// Opens the default adapter and starts following its power state.
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        let initial = match adapter.is_available().await {
            Ok(true) => AdapterState::PoweredOn,
            Ok(false) => AdapterState::PoweredOff,
            Err(e) => {
                warn!("Could not query adapter availability: {}", e);
                AdapterState::Unknown
            }
        };
        info!("Bluetooth adapter opened, state {:?}", initial);

        let (adapter_tx, _) = broadcast::channel(16);
        let (disconnects, _) = broadcast::channel(16);
        let transport = Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            adapter_state: Arc::new(Mutex::new(initial)),
            adapter_tx,
            disconnects,
        };
        transport.spawn_adapter_watcher();
        Ok(transport)
    }

    fn spawn_adapter_watcher(&self) {
        let adapter = self.adapter.clone();
        let adapter_state = self.adapter_state.clone();
        let adapter_tx = self.adapter_tx.clone();

        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to subscribe to adapter events: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                let state = match event {
                    Ok(AdapterEvent::Available) => AdapterState::PoweredOn,
                    Ok(AdapterEvent::Unavailable) => AdapterState::PoweredOff,
                    Err(e) => {
                        warn!("Adapter event error: {}", e);
                        continue;
                    }
                };
                info!("Bluetooth adapter state changed: {:?}", state);
                *lock(&adapter_state) = state;
                let _ = adapter_tx.send(state);
            }
            info!("Adapter event stream has ended.");
        });
    }

    /// Watches one device until it disconnects, then reports it once.
    fn spawn_disconnect_watcher(&self, device: Device) {
        let adapter = self.adapter.clone();
        let characteristics = self.characteristics.clone();
        let disconnects = self.disconnects.clone();

        tokio::spawn(async move {
            let id = device.id().to_string();
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch connection events for {}: {}", id, e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if matches!(event, ConnectionEvent::Disconnected) {
                    info!("Device {} disconnected", id);
                    lock(&characteristics).retain(|(device_id, _), _| device_id != &id);
                    let _ = disconnects.send(id);
                    return;
                }
            }
        });
    }

    async fn find_device(&self, id: &str) -> Result<Device, TransportError> {
        if let Some(device) = lock(&self.devices).get(id).cloned() {
            return Ok(device);
        }
        // Devices bonded or connected by another process never show up in scans
        let connected = self.adapter.connected_devices().await?;
        let device = connected
            .into_iter()
            .find(|device| device.id().to_string() == id)
            .ok_or(TransportError::NotFound)?;
        lock(&self.devices).insert(id.to_string(), device.clone());
        Ok(device)
    }

    /// Like `find_device`, but scans for a device this process has not seen
    /// yet, giving up at `deadline`.
    async fn resolve_device(&self, id: &str, deadline: Instant) -> Result<Device, TransportError> {
        match self.find_device(id).await {
            Err(TransportError::NotFound) => {}
            found => return found,
        }

        info!("Device {} not seen yet, scanning for it", id);
        let scan_stream = self
            .adapter
            .scan(&[])
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;
        let discovered = first_match(scan_stream, deadline, |discovered| {
            discovered.device.id().to_string() == id
        })
        .await
        .ok_or(TransportError::NotFound)?;

        lock(&self.devices).insert(id.to_string(), discovered.device.clone());
        Ok(discovered.device)
    }

    fn handle_for(device: &Device, rssi: Option<i16>) -> PeripheralHandle {
        PeripheralHandle::new(device.id().to_string(), device.name().ok(), rssi)
    }
}

async fn caps_of(characteristic: &Characteristic) -> ChannelCaps {
    match characteristic.properties().await {
        Ok(props) => ChannelCaps {
            notifiable: props.notify || props.indicate,
            writable_with_response: props.write,
            writable_without_response: props.write_without_response,
        },
        Err(e) => {
            warn!("Could not read properties of {}: {}", characteristic.uuid(), e);
            ChannelCaps::default()
        }
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn adapter_state(&self) -> AdapterState {
        *lock(&self.adapter_state)
    }

    fn adapter_events(&self, emit_current: bool) -> BoxStream<'static, AdapterState> {
        let receiver = self.adapter_tx.subscribe();
        let current = emit_current.then(|| *lock(&self.adapter_state));
        Box::pin(stream::iter(current).chain(broadcast_stream(receiver)))
    }

    fn disconnect_events(&self) -> BoxStream<'static, String> {
        broadcast_stream(self.disconnects.subscribe())
    }

    async fn scan(&self, service_filter: Option<Uuid>) -> Result<ScanStream, TransportError> {
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let (tx, mut rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let services: Vec<Uuid> = service_filter.into_iter().collect();
            let mut scan_stream = match adapter.scan(&services).await {
                Ok(scan_stream) => {
                    let _ = ready_tx.send(Ok(()));
                    scan_stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(TransportError::Scan(e.to_string())));
                    return;
                }
            };

            loop {
                tokio::select! {
                    // The consumer dropped the stream
                    _ = tx.closed() => break,
                    result = scan_stream.next() => match result {
                        Some(discovered) => {
                            let device = discovered.device;
                            let id = device.id().to_string();
                            let name = discovered
                                .adv_data
                                .local_name
                                .or_else(|| device.name().ok());
                            lock(&devices).insert(id.clone(), device);
                            let handle = PeripheralHandle::new(id, name, discovered.rssi);
                            if tx.send(Ok(handle)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = tx
                                .send(Err(TransportError::Scan("scan stream ended".into())))
                                .await;
                            break;
                        }
                    }
                }
            }
            debug!("Scan task finished (filter: {:?})", service_filter);
        });

        ready_rx
            .await
            .map_err(|_| TransportError::Scan("scan task aborted".into()))??;

        Ok(Box::pin(stream::poll_fn(move |cx| rx.poll_recv(cx))))
    }

    async fn connect(&self, id: &str, timeout: Duration) -> Result<PeripheralHandle, TransportError> {
        // Lookup and connect share one deadline
        let deadline = Instant::now() + timeout;
        let device = self.resolve_device(id, deadline).await?;

        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            tokio::time::timeout_at(deadline, self.adapter.connect_device(&device))
                .await
                .map_err(|_| TransportError::Timeout)??;
        }
        self.spawn_disconnect_watcher(device.clone());

        let rssi = device.rssi().await.ok();
        Ok(Self::handle_for(&device, rssi))
    }

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError> {
        lock(&self.characteristics).retain(|(device_id, _), _| device_id != id);
        let Some(device) = lock(&self.devices).get(id).cloned() else {
            return Ok(());
        };
        if device.is_connected().await {
            info!("Disconnecting from device {}", id);
            self.adapter.disconnect_device(&device).await?;
        } else {
            info!("Device {} not connected", id);
        }
        Ok(())
    }

    async fn is_connected(&self, id: &str) -> bool {
        let device = lock(&self.devices).get(id).cloned();
        match device {
            Some(device) => device.is_connected().await,
            None => false,
        }
    }

    async fn discover_services(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Vec<ServiceInfo>, TransportError> {
        let device = self.find_device(id).await?;
        let services = device.discover_services_with_uuid(service).await?;

        let mut infos = Vec::with_capacity(services.len());
        for service in services {
            let mut characteristics = Vec::new();
            for characteristic in service.discover_characteristics().await? {
                let caps = caps_of(&characteristic).await;
                debug!("Characteristic {} caps {:?}", characteristic.uuid(), caps);
                characteristics.push(CharacteristicInfo {
                    uuid: characteristic.uuid(),
                    caps,
                });
                lock(&self.characteristics)
                    .insert((id.to_string(), characteristic.uuid()), characteristic);
            }
            infos.push(ServiceInfo {
                uuid: service.uuid(),
                characteristics,
            });
        }
        Ok(infos)
    }

    async fn write(&self, channel: &WritableChannel, data: &[u8]) -> Result<(), TransportError> {
        let characteristic = lock(&self.characteristics)
            .get(&(channel.device_id.clone(), channel.characteristic))
            .cloned()
            .ok_or(TransportError::Disconnected)?;

        let result = if channel.caps.writable_without_response {
            characteristic.write_without_response(data).await
        } else {
            characteristic.write(data).await
        };
        result.map_err(|e| match e.kind() {
            ErrorKind::NotConnected => TransportError::Disconnected,
            _ => TransportError::WriteFailed(e.to_string()),
        })
    }

    async fn read_signal_strength(&self, id: &str) -> Option<i16> {
        let device = lock(&self.devices).get(id).cloned()?;
        match device.rssi().await {
            Ok(rssi) => Some(rssi),
            Err(e) => {
                debug!("RSSI read failed for {}: {}", id, e);
                None
            }
        }
    }
}
