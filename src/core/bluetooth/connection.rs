//! Connection supervision for the badge
//! Owns the single logical connection: direct reconnects, scan fallback,
//! retries with backoff, channel discovery and recovery from drops.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LinkConfig;
use crate::core::bluetooth::constants::LAST_DEVICE_STORAGE_KEY;
use crate::core::bluetooth::error::{LinkError, TransportError};
use crate::core::bluetooth::scanner::{BluetoothScanner, ScanOutcome};
use crate::core::bluetooth::signal::spawn_signal_poll;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{
    AdapterState, ConnectionState, LinkStatus, PeripheralHandle, WritableChannel,
};
use crate::storage::KeyValueStore;

/// Retry bookkeeping for one auto-connect run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    attempt: u32,
    last_failure: Option<String>,
}

impl RetryContext {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// Delay to wait before the current attempt.
    pub fn next_delay(&self, config: &LinkConfig) -> Duration {
        config.backoff(self.attempt)
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.attempt < max_retries
    }

    pub fn record_failure(&mut self, reason: impl fmt::Display) {
        self.last_failure = Some(reason.to_string());
        self.attempt += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// How an auto-connect run ended
#[derive(Debug)]
pub enum AutoConnectOutcome {
    Connected(PeripheralHandle),
    /// Another attempt was running or a badge was already connected
    AlreadyActive,
    /// No preferred or remembered badge to connect to
    NoTarget,
    /// Every retry failed; `autoconnect_failed` is now set
    Exhausted,
    /// Something else changed the state while the run was waiting
    Interrupted,
    /// Failed in a way retrying cannot fix
    Rejected(LinkError),
}

/// Result of one pass through the auto-connect steps
enum Attempt {
    Connected(PeripheralHandle),
    Retry(LinkError),
    Fatal(LinkError),
    Interrupted,
}

/// Supervises the one connection to the badge
pub struct ConnectionSupervisor<T: Transport> {
    transport: Arc<T>,
    config: Arc<LinkConfig>,
    store: Arc<dyn KeyValueStore>,
    scanner: BluetoothScanner<T>,
    status: Arc<watch::Sender<LinkStatus>>,
    /// Bumped for every committed connection
    epoch: Arc<AtomicU64>,
    signal_token: Arc<Mutex<Option<CancellationToken>>>,
    shutdown: CancellationToken,
}

impl<T: Transport> Clone for ConnectionSupervisor<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            scanner: self.scanner.clone(),
            status: self.status.clone(),
            epoch: self.epoch.clone(),
            signal_token: self.signal_token.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub fn new(transport: Arc<T>, config: Arc<LinkConfig>, store: Arc<dyn KeyValueStore>) -> Self {
        let (status, _) = watch::channel(LinkStatus::default());
        Self {
            scanner: BluetoothScanner::new(transport.clone()),
            transport,
            config,
            store,
            status: Arc::new(status),
            epoch: Arc::new(AtomicU64::new(0)),
            signal_token: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    pub fn scanner(&self) -> &BluetoothScanner<T> {
        &self.scanner
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Channel of the committed connection, if any
    pub fn channel(&self) -> Option<WritableChannel> {
        self.status.borrow().state.channel().cloned()
    }

    pub(crate) fn update(&self, modify: impl FnOnce(&mut LinkStatus) -> bool) -> bool {
        self.status.send_if_modified(modify)
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            debug!("Connection state: {:?} -> {:?}", status.state, state);
            if !matches!(state, ConnectionState::Connected { .. }) {
                status.rssi = None;
            }
            status.state = state;
            true
        });
    }

    /// Moves to `Connecting { attempt }` unless a connection is already
    /// underway or up. This is the only admission check for connects.
    fn try_begin(&self) -> bool {
        self.status.send_if_modified(|status| {
            if status.state.is_active() {
                return false;
            }
            status.state = ConnectionState::Connecting { attempt: 0 };
            status.autoconnect_failed = false;
            status.rssi = None;
            true
        })
    }

    /// Publishes the retry counter, failing when the run was interrupted.
    fn continue_attempt(&self, attempt: u32) -> bool {
        let mut still_connecting = false;
        self.status.send_if_modified(|status| match status.state {
            ConnectionState::Connecting { attempt: current } => {
                still_connecting = true;
                if current == attempt {
                    return false;
                }
                status.state = ConnectionState::Connecting { attempt };
                true
            }
            _ => false,
        });
        still_connecting
    }

    fn give_up(&self) {
        self.status.send_if_modified(|status| {
            if !matches!(status.state, ConnectionState::Connecting { .. }) {
                return false;
            }
            status.state = ConnectionState::Idle;
            status.autoconnect_failed = true;
            true
        });
    }

    /// Returns to `Idle` if a connect attempt was in progress.
    fn abandon_attempt(&self) {
        self.status.send_if_modified(|status| {
            if !matches!(status.state, ConnectionState::Connecting { .. }) {
                return false;
            }
            status.state = ConnectionState::Idle;
            true
        });
    }

    /// The badge auto-connect aims for: the configured one, else the one
    /// remembered from the last session.
    pub async fn resolve_target(&self) -> Option<String> {
        if let Some(id) = &self.config.preferred_device {
            return Some(id.clone());
        }
        match self.store.get(LAST_DEVICE_STORAGE_KEY).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not read remembered badge: {}", e);
                None
            }
        }
    }

    /// Drops the remembered badge so auto-connect only uses the configured one.
    pub async fn forget_target(&self) -> Result<(), LinkError> {
        info!("Forgetting remembered badge");
        self.store.delete(LAST_DEVICE_STORAGE_KEY).await
    }

    /// Connects to the preferred badge, retrying with backoff.
    ///
    /// Direct connects that time out or find nothing fall back to a scan.
    /// After `max_retries` failed retries the run gives up, sets
    /// `autoconnect_failed` and returns to `Idle`.
    pub async fn auto_connect(&self) -> AutoConnectOutcome {
        let Some(target) = self.resolve_target().await else {
            info!("No badge to auto-connect to.");
            return AutoConnectOutcome::NoTarget;
        };

        let adapter_state = self.transport.adapter_state().await;
        if adapter_state != AdapterState::PoweredOn {
            warn!("Skipping auto-connect, radio is {:?}", adapter_state);
            return AutoConnectOutcome::Rejected(LinkError::RadioUnavailable(adapter_state));
        }

        if !self.try_begin() {
            debug!("Auto-connect skipped, connection already active");
            return AutoConnectOutcome::AlreadyActive;
        }
        info!("Auto-connecting to {}", target);

        let mut retry = RetryContext::default();
        loop {
            if !self.continue_attempt(retry.attempt()) {
                info!("Auto-connect interrupted");
                return AutoConnectOutcome::Interrupted;
            }
            if retry.attempt() > 0 {
                let delay = retry.next_delay(&self.config);
                info!(
                    "Retrying auto-connect ({}/{}) in {} ms, last failure: {}",
                    retry.attempt(),
                    self.config.max_retries,
                    delay.as_millis(),
                    retry.last_failure().unwrap_or("unknown")
                );
                tokio::time::sleep(delay).await;
                if !self.continue_attempt(retry.attempt()) {
                    info!("Auto-connect interrupted during backoff");
                    return AutoConnectOutcome::Interrupted;
                }
            }

            match self.attempt(&target, &retry).await {
                Attempt::Connected(handle) => return AutoConnectOutcome::Connected(handle),
                Attempt::Interrupted => return AutoConnectOutcome::Interrupted,
                Attempt::Fatal(e) => {
                    error!("Auto-connect to {} failed: {}", target, e);
                    self.give_up();
                    return AutoConnectOutcome::Rejected(e);
                }
                Attempt::Retry(e) => {
                    warn!("Auto-connect attempt {} failed: {}", retry.attempt() + 1, e);
                    if !retry.can_retry(self.config.max_retries) {
                        error!(
                            "Auto-connect gave up after {} attempts",
                            retry.attempt() + 1
                        );
                        self.give_up();
                        return AutoConnectOutcome::Exhausted;
                    }
                    retry.record_failure(e);
                }
            }
        }
    }

    async fn attempt(&self, target: &str, retry: &RetryContext) -> Attempt {
        let timeout = self.config.connect_timeout();

        match self.transport.connect(target, timeout).await {
            Ok(handle) => return self.settle(handle).await,
            Err(e) if e.is_absent() => {
                debug!("Direct connect to {} failed ({}), scanning", target, e);
            }
            Err(e) if retry.can_retry(self.config.max_retries) => return Attempt::Retry(e.into()),
            Err(e) => {
                debug!("Direct connect failed on last attempt ({}), scanning", e);
            }
        }

        let token = self.scanner.begin();
        let outcome = self
            .scanner
            .run(
                Some(self.config.service_uuid),
                Some(target),
                self.config.scan_timeout(),
                &token,
            )
            .await;
        token.cancel();

        match outcome {
            Ok(ScanOutcome::Found(found)) => match self.transport.connect(&found.id, timeout).await {
                Ok(handle) => self.settle(handle).await,
                Err(e) => Attempt::Retry(e.into()),
            },
            Ok(ScanOutcome::Cancelled) => Attempt::Retry(LinkError::Connection(TransportError::Scan(
                "scan cancelled".into(),
            ))),
            Ok(ScanOutcome::TimedOut | ScanOutcome::Ended) => Attempt::Retry(LinkError::DeviceNotFound),
            Err(e) => Attempt::Retry(LinkError::Connection(e)),
        }
    }

    async fn settle(&self, handle: PeripheralHandle) -> Attempt {
        match self.commit(handle).await {
            Ok(Some(handle)) => Attempt::Connected(handle),
            Ok(None) => Attempt::Interrupted,
            Err(e @ LinkError::CharacteristicMissing { .. }) => Attempt::Fatal(e),
            Err(e) => Attempt::Retry(e),
        }
    }

    /// Validates the write channel on a freshly connected peripheral and
    /// publishes `Connected`.
    ///
    /// Any failure tears the low-level connection down. `Ok(None)` means the
    /// attempt was abandoned by someone else while discovery ran.
    async fn commit(&self, handle: PeripheralHandle) -> Result<Option<PeripheralHandle>, LinkError> {
        let service = self.config.service_uuid;
        let characteristic = self.config.write_characteristic_uuid;

        let services = match self.transport.discover_services(&handle.id, service).await {
            Ok(services) => services,
            Err(e) => {
                warn!("Service discovery on {} failed: {}", handle.id, e);
                self.cancel_quietly(&handle.id).await;
                return Err(e.into());
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(channel) = WritableChannel::select(&handle.id, &services, service, characteristic, epoch)
        else {
            for found in &services {
                info!("Available service: {}", found.uuid);
            }
            error!(
                "Badge {} has no writable characteristic {} in service {}",
                handle.id, characteristic, service
            );
            self.cancel_quietly(&handle.id).await;
            return Err(LinkError::CharacteristicMissing {
                service,
                characteristic,
            });
        };

        let committed = self.status.send_if_modified(|status| {
            if !matches!(status.state, ConnectionState::Connecting { .. }) {
                return false;
            }
            status.state = ConnectionState::Connected {
                handle: handle.clone(),
                channel,
            };
            status.autoconnect_failed = false;
            status.rssi = handle.rssi;
            true
        });
        if !committed {
            info!("Connection to {} no longer wanted, dropping it", handle.id);
            self.cancel_quietly(&handle.id).await;
            return Ok(None);
        }

        info!("Connected to {} (epoch {})", handle.display_name(), epoch);
        if let Err(e) = self.store.set(LAST_DEVICE_STORAGE_KEY, &handle.id).await {
            warn!("Could not remember badge {}: {}", handle.id, e);
        }
        self.start_signal_poll(&handle.id);
        Ok(Some(handle))
    }

    async fn cancel_quietly(&self, id: &str) {
        if let Err(e) = self.transport.cancel_connection(id).await {
            warn!("Failed to cancel connection to {}: {}", id, e);
        }
    }

    fn start_signal_poll(&self, id: &str) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self
            .signal_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }
        spawn_signal_poll(
            self.transport.clone(),
            self.status.clone(),
            id.to_string(),
            self.config.rssi_interval(),
            token,
        );
    }

    fn stop_signal_poll(&self) {
        if let Some(token) = self
            .signal_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    /// A single bounded connect to a discovered peripheral, without scanning
    /// or retries. Failures come back classified.
    pub async fn connect_manual(&self, id: &str) -> Result<PeripheralHandle, LinkError> {
        if !self.try_begin() {
            return Err(LinkError::Busy);
        }
        self.scanner.stop_scan();
        info!("Connecting to {}", id);

        let handle = match self.transport.connect(id, self.config.connect_timeout()).await {
            Ok(handle) => handle,
            Err(e) => {
                let error = LinkError::from(e);
                warn!("Connect to {} failed: {}", id, error.user_message());
                self.abandon_attempt();
                return Err(error);
            }
        };

        match self.commit(handle).await {
            Ok(Some(handle)) => Ok(handle),
            Ok(None) => Err(LinkError::NotConnected),
            Err(e) => {
                self.abandon_attempt();
                Err(e)
            }
        }
    }

    /// Drops the current connection, or abandons an attempt in progress.
    /// Never triggers automatic recovery.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let current = self.status.borrow().state.clone();
        match current {
            ConnectionState::Connected { handle, .. } => {
                self.set_state(ConnectionState::Disconnecting);
                self.stop_signal_poll();
                info!("Disconnecting from {}", handle.display_name());
                let result = self.transport.cancel_connection(&handle.id).await;
                self.set_state(ConnectionState::Idle);
                result.map_err(LinkError::from)
            }
            ConnectionState::Connecting { .. } | ConnectionState::Scanning => {
                self.scanner.stop_scan();
                self.set_state(ConnectionState::Idle);
                Ok(())
            }
            ConnectionState::Idle | ConnectionState::Disconnecting => {
                info!("No device connected");
                Ok(())
            }
        }
    }

    /// Replaces the published channel after a transfer re-acquired it on the
    /// same connection.
    pub fn refresh_channel(&self, channel: WritableChannel) -> bool {
        self.status.send_if_modified(|status| match &mut status.state {
            ConnectionState::Connected { channel: current, .. }
                if current.device_id == channel.device_id
                    && current.epoch == channel.epoch
                    && *current != channel =>
            {
                debug!("Refreshed write channel for {}", channel.device_id);
                *current = channel;
                true
            }
            _ => false,
        })
    }

    /// Handles a peripheral dropping. Only an unsolicited loss of the
    /// connected badge is acted on: state goes back to `Idle` and one
    /// auto-connect is scheduled after the reconnect delay.
    pub fn handle_disconnect(&self, id: &str) -> Option<JoinHandle<AutoConnectOutcome>> {
        let lost = self.status.send_if_modified(|status| {
            if status.state.connected_id() != Some(id) {
                return false;
            }
            status.state = ConnectionState::Idle;
            status.rssi = None;
            true
        });
        if !lost {
            debug!("Ignoring disconnect of {}", id);
            return None;
        }

        warn!("Badge {} disconnected unexpectedly", id);
        self.stop_signal_poll();

        let supervisor = self.clone();
        let delay = self.config.reconnect_delay();
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = supervisor.shutdown.cancelled() => AutoConnectOutcome::Interrupted,
                _ = tokio::time::sleep(delay) => supervisor.auto_connect().await,
            }
        }))
    }

    /// Follows the transport's disconnect notifications.
    pub fn watch_disconnects(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let mut events = self.transport.disconnect_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    event = events.next() => match event {
                        Some(id) => {
                            supervisor.handle_disconnect(&id);
                        }
                        None => break,
                    }
                }
            }
            debug!("Disconnect watcher finished");
        })
    }

    /// Follows radio power changes: auto-connects shortly after the radio
    /// powers on and drops any pending attempt when it goes away.
    pub fn watch_adapter(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let mut events = self.transport.adapter_events(true);
        tokio::spawn(async move {
            loop {
                let state = tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    event = events.next() => match event {
                        Some(state) => state,
                        None => break,
                    }
                };
                info!("Radio state: {:?}", state);

                if state == AdapterState::PoweredOn {
                    let supervisor = supervisor.clone();
                    let delay = supervisor.config.power_on_delay();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = supervisor.shutdown.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {
                                supervisor.auto_connect().await;
                            }
                        }
                    });
                } else {
                    supervisor.scanner.stop_scan();
                    supervisor.status.send_if_modified(|status| {
                        if matches!(status.state, ConnectionState::Connected { .. } | ConnectionState::Idle) {
                            return false;
                        }
                        status.state = ConnectionState::Idle;
                        true
                    });
                }
            }
            debug!("Adapter watcher finished");
        })
    }

    /// Starts both watchers.
    pub fn start(&self) {
        self.watch_disconnects();
        self.watch_adapter();
    }

    /// Runs a discovery scan in the calling task, filling the device list.
    ///
    /// Refused while connecting or connected. The list is cleared first and
    /// the scan ends after `discovery_scan_ms` or when stopped.
    pub async fn discover(&self) -> Result<Vec<PeripheralHandle>, LinkError> {
        let token = self.begin_discovery().await?;
        self.run_discovery(token).await
    }

    /// Starts a discovery scan in the background.
    pub async fn start_scan(&self) -> Result<(), LinkError> {
        let token = self.begin_discovery().await?;
        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.run_discovery(token).await {
                error!("Scan failed: {}", e);
            }
        });
        Ok(())
    }

    pub fn stop_scan(&self) {
        self.scanner.stop_scan();
    }

    async fn begin_discovery(&self) -> Result<CancellationToken, LinkError> {
        if self.status.borrow().state.is_active() {
            return Err(LinkError::Busy);
        }
        let adapter_state = self.transport.adapter_state().await;
        if adapter_state != AdapterState::PoweredOn {
            return Err(LinkError::RadioUnavailable(adapter_state));
        }

        let token = self.scanner.begin();
        let admitted = self.status.send_if_modified(|status| {
            if status.state.is_active() {
                return false;
            }
            status.state = ConnectionState::Scanning;
            true
        });
        if !admitted {
            token.cancel();
            return Err(LinkError::Busy);
        }
        self.scanner.clear_devices();
        Ok(token)
    }

    async fn run_discovery(&self, token: CancellationToken) -> Result<Vec<PeripheralHandle>, LinkError> {
        let outcome = self
            .scanner
            .run(
                Some(self.config.service_uuid),
                None,
                self.config.discovery_scan(),
                &token,
            )
            .await;
        token.cancel();

        self.status.send_if_modified(|status| {
            if status.state != ConnectionState::Scanning {
                return false;
            }
            status.state = ConnectionState::Idle;
            true
        });

        let outcome = outcome.map_err(LinkError::Connection)?;
        let devices = self.scanner.devices();
        info!("Scan finished ({:?}), {} device(s) found", outcome, devices.len());
        Ok(devices)
    }

    /// Stops the watchers, any scan and the signal poll.
    pub fn shutdown(&self) {
        self.scanner.stop_scan();
        self.stop_signal_poll();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_retry_context() {
        let config = LinkConfig::default();
        let mut retry = RetryContext::default();
        assert_eq!(retry.next_delay(&config), Duration::ZERO);
        assert!(retry.can_retry(3));

        retry.record_failure(LinkError::DeviceNotFound);
        assert_eq!(retry.attempt(), 1);
        assert_eq!(retry.last_failure(), Some("device not found"));
        assert_eq!(retry.next_delay(&config), Duration::from_millis(1000));

        retry.record_failure("again");
        retry.record_failure("again");
        assert_eq!(retry.attempt(), 3);
        assert!(!retry.can_retry(3));
        assert_eq!(retry.next_delay(&config), Duration::from_millis(4000));

        retry.reset();
        assert_eq!(retry, RetryContext::default());
    }
}
