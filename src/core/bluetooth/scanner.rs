use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::{ScanStream, Transport, broadcast_stream};
use crate::core::bluetooth::types::PeripheralHandle;

/// How a scan ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The requested target showed up
    Found(PeripheralHandle),
    /// The scan window elapsed
    TimedOut,
    /// Stopped by the caller
    Cancelled,
    /// The radio stopped delivering results
    Ended,
}

/// Runs scans and keeps the de-duplicated list of discovered peripherals
pub struct BluetoothScanner<T: Transport> {
    transport: Arc<T>,
    devices: Arc<Mutex<HashMap<String, PeripheralHandle>>>,
    cancel_token: Arc<Mutex<CancellationToken>>,
    device_events: broadcast::Sender<PeripheralHandle>,
}

impl<T: Transport> Clone for BluetoothScanner<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            devices: self.devices.clone(),
            cancel_token: self.cancel_token.clone(),
            device_events: self.device_events.clone(),
        }
    }
}

impl<T: Transport> BluetoothScanner<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let (device_events, _) = broadcast::channel(64);
        let cancel_token = CancellationToken::new();
        // Nothing is running yet
        cancel_token.cancel();
        Self {
            transport,
            devices: Arc::new(Mutex::new(HashMap::new())),
            cancel_token: Arc::new(Mutex::new(cancel_token)),
            device_events,
        }
    }

    fn devices_guard(&self) -> MutexGuard<'_, HashMap<String, PeripheralHandle>> {
        self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of every peripheral seen since the list was last cleared
    pub fn devices(&self) -> Vec<PeripheralHandle> {
        let mut devices: Vec<_> = self.devices_guard().values().cloned().collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    pub fn device(&self, id: &str) -> Option<PeripheralHandle> {
        self.devices_guard().get(id).cloned()
    }

    pub fn clear_devices(&self) {
        self.devices_guard().clear();
    }

    /// Newly discovered or updated peripherals
    pub fn device_events(&self) -> BoxStream<'static, PeripheralHandle> {
        broadcast_stream(self.device_events.subscribe())
    }

    /// Records a scan result. Returns true when the list changed; repeated
    /// advertisements with the same name and signal are ignored.
    pub fn record(&self, handle: PeripheralHandle) -> bool {
        let changed = {
            let mut devices = self.devices_guard();
            match devices.get(&handle.id) {
                Some(known) if known.name == handle.name && known.rssi == handle.rssi => false,
                _ => {
                    devices.insert(handle.id.clone(), handle.clone());
                    true
                }
            }
        };
        if changed {
            debug!(
                "Found device - ID: {}, Name: {:?}, RSSI: {:?}",
                handle.id, handle.name, handle.rssi
            );
            let _ = self.device_events.send(handle);
        }
        changed
    }

    /// Cancels any running scan and returns the token for a new one.
    pub fn begin(&self) -> CancellationToken {
        let mut guard = self
            .cancel_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.cancel();
        *guard = CancellationToken::new();
        guard.clone()
    }

    /// Stops the running scan. Stopping twice is a no-op.
    pub fn stop_scan(&self) {
        let guard = self
            .cancel_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.is_cancelled() {
            info!("Stopping Bluetooth scan.");
            guard.cancel();
        }
    }

    pub fn is_scanning(&self) -> bool {
        !self
            .cancel_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_cancelled()
    }

    /// Opens a scan limited to `service`, falling back to an unfiltered scan
    /// when the filtered one cannot start. The flag tells whether the
    /// returned stream is still filtered.
    async fn open(&self, service: Option<Uuid>) -> Result<(ScanStream, bool), TransportError> {
        if let Some(service) = service {
            match self.transport.scan(Some(service)).await {
                Ok(stream) => return Ok((stream, true)),
                Err(e) => warn!("Service UUID scan failed, scanning all devices: {}", e),
            }
        }
        Ok((self.transport.scan(None).await?, false))
    }

    /// Scans until `target` is seen, `timeout` elapses or `token` is cancelled.
    ///
    /// Without a target the scan only fills the device list. A filtered scan
    /// that errors is restarted once without the filter.
    pub async fn run(
        &self,
        service: Option<Uuid>,
        target: Option<&str>,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ScanOutcome, TransportError> {
        info!("Starting bluetooth scan (filter: {:?}, target: {:?})", service, target);
        let (mut stream, mut filtered) = self.open(service).await?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Bluetooth scan cancelled.");
                    return Ok(ScanOutcome::Cancelled);
                }
                _ = &mut deadline => {
                    info!("Bluetooth scan window elapsed.");
                    return Ok(ScanOutcome::TimedOut);
                }
                result = stream.next() => match result {
                    Some(Ok(handle)) => {
                        let matched = target.is_some_and(|id| id == handle.id);
                        self.record(handle.clone());
                        if matched {
                            info!("Scan found target device {}", handle.display_name());
                            return Ok(ScanOutcome::Found(handle));
                        }
                    }
                    Some(Err(e)) if filtered => {
                        warn!("Scan error with service filter, retrying unfiltered: {}", e);
                        stream = self.transport.scan(None).await?;
                        filtered = false;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        return Ok(ScanOutcome::Ended);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::UUID_BADGE_SERVICE;
    use crate::core::bluetooth::simulated::{SimulatedBadge, SimulatedTransport};
    use pretty_assertions::assert_eq;

    fn scanner() -> (Arc<SimulatedTransport>, BluetoothScanner<SimulatedTransport>) {
        let transport = Arc::new(SimulatedTransport::new(SimulatedBadge::new("badge", "Badge")));
        (transport.clone(), BluetoothScanner::new(transport))
    }

    #[test]
    fn test_record_deduplicates() {
        let (_, scanner) = scanner();
        assert!(scanner.record(PeripheralHandle::new("a", Some("A".into()), Some(-60))));
        assert!(!scanner.record(PeripheralHandle::new("a", Some("A".into()), Some(-60))));
        assert!(scanner.record(PeripheralHandle::new("a", Some("A2".into()), Some(-60))));
        assert!(scanner.record(PeripheralHandle::new("a", Some("A2".into()), Some(-40))));
        assert_eq!(scanner.devices().len(), 1);
        assert_eq!(scanner.device("a").unwrap().rssi, Some(-40));
    }

    #[test]
    fn test_devices_sorted_by_signal() {
        let (_, scanner) = scanner();
        scanner.record(PeripheralHandle::new("far", None, Some(-90)));
        scanner.record(PeripheralHandle::new("near", None, Some(-30)));
        let ids: Vec<_> = scanner.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["near", "far"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finds_target_with_filter() {
        let (transport, scanner) = scanner();
        let token = scanner.begin();
        let outcome = scanner
            .run(Some(UUID_BADGE_SERVICE), Some("badge"), Duration::from_secs(15), &token)
            .await
            .unwrap();
        assert!(matches!(outcome, ScanOutcome::Found(ref h) if h.id == "badge"));
        assert_eq!(transport.scans(), vec![Some(UUID_BADGE_SERVICE)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_unfiltered() {
        let (transport, scanner) = scanner();
        transport.set_filtered_scan_fails(true);
        transport.add_bystander(PeripheralHandle::new("speaker", Some("Speaker".into()), Some(-70)));

        let token = scanner.begin();
        let outcome = scanner
            .run(Some(UUID_BADGE_SERVICE), Some("badge"), Duration::from_secs(15), &token)
            .await
            .unwrap();
        assert!(matches!(outcome, ScanOutcome::Found(_)));
        assert_eq!(transport.scans(), vec![Some(UUID_BADGE_SERVICE), None]);
        assert!(scanner.device("speaker").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_absent() {
        let (transport, scanner) = scanner();
        transport.set_reachable(false);
        let token = scanner.begin();
        let started = tokio::time::Instant::now();
        let outcome = scanner
            .run(None, Some("badge"), Duration::from_secs(15), &token)
            .await
            .unwrap();
        assert_eq!(outcome, ScanOutcome::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (_, scanner) = scanner();
        assert!(!scanner.is_scanning());
        scanner.stop_scan();

        let token = scanner.begin();
        assert!(scanner.is_scanning());
        let runner = scanner.clone();
        let task = tokio::spawn(async move {
            runner.run(None, None, Duration::from_secs(60), &token).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        scanner.stop_scan();
        scanner.stop_scan();
        assert_eq!(task.await.unwrap().unwrap(), ScanOutcome::Cancelled);
        assert!(!scanner.is_scanning());
        // Discovery results stay available after stopping
        assert!(scanner.device("badge").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_scan_cancels_previous() {
        let (_, scanner) = scanner();
        let first = scanner.begin();
        let second = scanner.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }
}
