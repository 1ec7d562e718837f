//! Tauri commands
//! This module defines the commands a frontend can invoke, bundled as a
//! plugin that also forwards link status changes as events.
//!
//! Events:
//! - "link-status" with the full [`LinkStatus`] whenever it changes
//! - "device-found" with a [`PeripheralHandle`] for each new or updated device

use futures_util::StreamExt;
use log::error;
use serde::Serialize;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{Emitter, Manager, Runtime, State};

use crate::core::bluetooth::{
    AutoConnectOutcome, LinkStatus, PeripheralHandle, SendReport, StatusIndicator,
};
use crate::state::AppState;

/// Link status as sent to the frontend
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    #[serde(flatten)]
    pub status: LinkStatus,
    pub indicator: StatusIndicator,
}

impl From<LinkStatus> for StatusPayload {
    fn from(status: LinkStatus) -> Self {
        Self {
            indicator: status.indicator(),
            status,
        }
    }
}

/// Summary of a finished send
#[derive(Debug, Clone, Serialize)]
pub struct SendSummary {
    pub chunks: usize,
    pub bytes: usize,
}

impl From<SendReport> for SendSummary {
    fn from(report: SendReport) -> Self {
        Self {
            chunks: report.chunks,
            bytes: report.bytes,
        }
    }
}

/// Starts a discovery scan; results arrive as "device-found" events
#[tauri::command]
pub async fn start_scan(app_state: State<'_, AppState>) -> Result<(), String> {
    app_state.manager.start_scan().await.map_err(|e| e.user_message())
}

#[tauri::command]
pub async fn stop_scan(app_state: State<'_, AppState>) -> Result<(), String> {
    app_state.manager.stop_scan();
    Ok(())
}

/// Connects to a discovered badge
///
/// # Arguments
/// * `device_id` - The unique identifier of the device to connect to (platform-specific ID)
#[tauri::command]
pub async fn connect_to_device(
    device_id: String,
    app_state: State<'_, AppState>,
) -> Result<PeripheralHandle, String> {
    app_state
        .manager
        .connect_to_device(&device_id)
        .await
        .map_err(|e| e.user_message())
}

/// Connects to the preferred or remembered badge. Returns whether a badge is
/// connected afterwards.
#[tauri::command]
pub async fn auto_connect(app_state: State<'_, AppState>) -> Result<bool, String> {
    match app_state.manager.auto_connect().await {
        AutoConnectOutcome::Connected(_) | AutoConnectOutcome::AlreadyActive => {
            Ok(app_state.manager.is_connected())
        }
        AutoConnectOutcome::Rejected(e) => Err(e.user_message()),
        _ => Ok(false),
    }
}

#[tauri::command]
pub async fn disconnect(app_state: State<'_, AppState>) -> Result<(), String> {
    app_state.manager.disconnect().await.map_err(|e| e.user_message())
}

#[tauri::command]
pub async fn send_text(
    text: String,
    color: String,
    app_state: State<'_, AppState>,
) -> Result<SendSummary, String> {
    app_state
        .manager
        .send_text(&text, &color)
        .await
        .map(SendSummary::from)
        .map_err(|e| e.user_message())
}

/// Sends an encoded image (PNG, JPEG, ...) with an optional caption
#[tauri::command]
pub async fn send_image(
    image: Vec<u8>,
    caption: Option<String>,
    app_state: State<'_, AppState>,
) -> Result<SendSummary, String> {
    app_state
        .manager
        .send_image(&image, caption.as_deref().unwrap_or_default())
        .await
        .map(SendSummary::from)
        .map_err(|e| e.user_message())
}

#[tauri::command]
pub async fn link_status(app_state: State<'_, AppState>) -> Result<StatusPayload, String> {
    Ok(app_state.manager.status().into())
}

#[tauri::command]
pub async fn list_devices(app_state: State<'_, AppState>) -> Result<Vec<PeripheralHandle>, String> {
    Ok(app_state.manager.devices())
}

/// Builds the plugin. The state is managed by the app and the manager's
/// watchers start with it.
pub fn init<R: Runtime>(state: AppState) -> TauriPlugin<R> {
    Builder::new("badge-link")
        .invoke_handler(tauri::generate_handler![
            start_scan,
            stop_scan,
            connect_to_device,
            auto_connect,
            disconnect,
            send_text,
            send_image,
            link_status,
            list_devices
        ])
        .setup(move |app, _api| {
            let manager = state.manager();
            let mut status = manager.subscribe();
            let mut devices = manager.device_events();
            app.manage(state);

            let handle = app.clone();
            tauri::async_runtime::spawn(async move {
                while status.changed().await.is_ok() {
                    let payload = StatusPayload::from(status.borrow_and_update().clone());
                    if let Err(e) = handle.emit("link-status", payload) {
                        error!("Failed to emit link-status event: {}", e);
                    }
                }
            });

            let handle = app.clone();
            tauri::async_runtime::spawn(async move {
                while let Some(device) = devices.next().await {
                    if let Err(e) = handle.emit("device-found", device) {
                        error!("Failed to emit device-found event: {}", e);
                    }
                }
            });

            // The watchers need a runtime context
            tauri::async_runtime::spawn(async move { manager.start() });
            Ok(())
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::{LinkError, TransportError};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_payload_carries_indicator() {
        let payload = StatusPayload::from(LinkStatus::default());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["state"]["state"], "idle");
        assert_eq!(json["indicator"]["status"], "disconnected");
        assert_eq!(json["sending"], false);
    }

    #[test]
    fn test_send_summary_drops_channel() {
        let summary = SendSummary::from(SendReport {
            chunks: 11,
            bytes: 1910,
            reacquired: None,
        });
        assert_eq!(
            serde_json::to_string(&summary).unwrap(),
            "{\"chunks\":11,\"bytes\":1910}"
        );
    }

    #[test]
    fn test_errors_reach_frontend_as_user_messages() {
        let result: Result<(), LinkError> = Err(LinkError::from(TransportError::NotFound));
        assert_eq!(
            result.map_err(|e| e.user_message()),
            Err("Device not found. Try scanning again.".to_string())
        );
    }
}
