//! Tauri plugin that exposes the chat core to webview windows.
//!
//! Register with `tauri::Builder::default().plugin(polaris_lib::desktop::init())`.
//! Webviews call `plugin:polaris|<command>`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Emitter, Manager, Runtime, State};

use crate::services::ai::{
    JsonResponse, ProxyCommand, RepaintSink, RequestSpec, StreamEvent, StreamEventSink, StreamProxy,
};
use crate::services::command::{CommandResult, CommandRunner, PreApproved};
use crate::services::config::{self, ProviderPublicConfig, ProviderSettings};
use crate::services::intent::{self, Intent, WindowLabel};
use crate::services::sync::{SyncEnvelope, SyncHub, SyncSubscription};

pub const PLUGIN_NAME: &str = "polaris";
pub const EVT_CHAT_REPAINT: &str = "chat-repaint";
pub const EVT_CHAT_SYNC: &str = "chat-sync";

/// Delivers proxy events to every webview as `stream-chunk` / `stream-error`.
pub struct AppEventSink<R: Runtime>(pub AppHandle<R>);

impl<R: Runtime> StreamEventSink for AppEventSink<R> {
    fn emit(&self, event: StreamEvent) -> bool {
        match self.0.emit(event.event_name(), &event) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Failed to emit {} for {}: {}", event.event_name(), event.stream_id(), err);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepaintPayload<'a> {
    message_id: &'a str,
    content: &'a str,
}

/// Repaints the streaming message in one window.
pub struct WindowRepaint<R: Runtime> {
    app: AppHandle<R>,
    label: String,
}

impl<R: Runtime> WindowRepaint<R> {
    pub fn new(app: AppHandle<R>, label: impl Into<String>) -> Self {
        Self {
            app,
            label: label.into(),
        }
    }
}

impl<R: Runtime> RepaintSink for WindowRepaint<R> {
    fn repaint(&self, message_id: &str, content: &str) {
        let payload = RepaintPayload { message_id, content };
        if let Err(err) = self.app.emit_to(self.label.as_str(), EVT_CHAT_REPAINT, payload) {
            log::debug!("Repaint of {} dropped: {}", self.label, err);
        }
    }
}

/// Forwards envelopes written by other windows to `label` until the hub closes.
pub fn forward_sync<R: Runtime>(app: AppHandle<R>, label: String, mut subscription: SyncSubscription) {
    tauri::async_runtime::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            if let Err(err) = app.emit_to(label.as_str(), EVT_CHAT_SYNC, &envelope) {
                log::warn!("Failed to forward sync envelope to {}: {}", label, err);
            }
        }
        log::debug!("Sync forwarding for {} stopped", label);
    });
}

/// Managed by the plugin; one per app.
pub struct DesktopState {
    proxy: Arc<StreamProxy>,
    hub: Arc<SyncHub>,
    runner: CommandRunner,
    provider: ProviderSettings,
    forwarding: Mutex<HashSet<String>>,
}

impl DesktopState {
    pub fn new(provider: ProviderSettings) -> Self {
        Self {
            proxy: Arc::new(StreamProxy::default()),
            hub: Arc::new(SyncHub::default()),
            runner: CommandRunner::default(),
            provider,
            forwarding: Mutex::new(HashSet::new()),
        }
    }

    pub fn proxy(&self) -> &Arc<StreamProxy> {
        &self.proxy
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    /// Starts forwarding to `label` once, and returns the slot's current JSON
    /// so the window can catch up.
    pub fn subscribe<R: Runtime>(&self, app: &AppHandle<R>, label: &str) -> Result<Option<String>, String> {
        let mut forwarding = self
            .forwarding
            .lock()
            .map_err(|_| "sync forwarding lock poisoned".to_string())?;
        if forwarding.insert(label.to_string()) {
            let subscription = self.hub.endpoint(label).subscribe();
            forward_sync(app.clone(), label.to_string(), subscription);
            log::debug!("Forwarding sync envelopes to {}", label);
        }
        Ok(self.hub.latest_json())
    }
}

#[tauri::command]
async fn proxy_command<R: Runtime>(
    app: AppHandle<R>,
    state: State<'_, DesktopState>,
    command: ProxyCommand,
) -> Result<(), String> {
    state
        .proxy
        .handle(command, AppEventSink(app))
        .map_err(|e| e.user_message())
}

#[tauri::command]
async fn proxy_api_request(
    state: State<'_, DesktopState>,
    url: String,
    options: RequestSpec,
) -> Result<JsonResponse, String> {
    state
        .proxy
        .request_json(&url, options)
        .await
        .map_err(|e| e.user_message())
}

#[tauri::command]
fn sync_publish(state: State<'_, DesktopState>, window_id: String, envelope: SyncEnvelope) {
    state.hub.endpoint(window_id).publish(&envelope);
}

#[tauri::command]
fn sync_subscribe<R: Runtime>(
    app: AppHandle<R>,
    state: State<'_, DesktopState>,
    window_id: String,
) -> Result<Option<String>, String> {
    state.subscribe(&app, &window_id)
}

#[tauri::command]
fn provider_config(state: State<'_, DesktopState>) -> ProviderPublicConfig {
    ProviderPublicConfig::from(&state.provider)
}

#[tauri::command]
async fn detect_ui_intent(
    state: State<'_, DesktopState>,
    message: String,
    windows: Vec<WindowLabel>,
) -> Result<Intent, String> {
    Ok(intent::detect_intent(&state.proxy, &state.provider, &message, &windows).await)
}

/// The webview asks the user before invoking this.
#[tauri::command]
async fn execute_command(
    state: State<'_, DesktopState>,
    command: String,
) -> Result<CommandResult, String> {
    state
        .runner
        .run(&command, &PreApproved)
        .await
        .map_err(|e| e.user_message())
}

pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new(PLUGIN_NAME)
        .invoke_handler(tauri::generate_handler![
            proxy_command,
            proxy_api_request,
            sync_publish,
            sync_subscribe,
            provider_config,
            detect_ui_intent,
            execute_command
        ])
        .setup(|app, _api| {
            let provider = config::load_chat_settings().provider;
            log::info!(
                "Desktop plugin ready ({}, model {})",
                provider.provider.as_str(),
                provider.model
            );
            app.manage(DesktopState::new(provider));
            Ok(())
        })
        .on_drop(|app| {
            if let Some(state) = app.try_state::<DesktopState>() {
                let cancelled = state.proxy.cancel_all();
                log::debug!("Cancelled {} streams on shutdown", cancelled);
            }
        })
        .build()
}

#[cfg(all(test, feature = "test-desktop"))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tauri::test::{mock_builder, mock_context, noop_assets, MockRuntime};
    use tauri::Listener;

    fn app() -> tauri::App<MockRuntime> {
        mock_builder()
            .plugin(init())
            .build(mock_context(noop_assets()))
            .unwrap()
    }

    #[test]
    fn plugin_manages_state() {
        let app = app();
        let state = app.try_state::<DesktopState>().unwrap();
        assert!(state.proxy().registry().is_empty());
    }

    #[test]
    fn stream_events_reach_listeners() {
        let app = app();
        let (tx, rx) = mpsc::channel();
        let event = StreamEvent::chunk("s1", "hi".to_string());
        app.listen_any(event.event_name(), move |e| {
            let _ = tx.send(e.payload().to_string());
        });

        assert!(AppEventSink(app.handle().clone()).emit(event));
        let payload = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(payload.contains("\"s1\""));
        assert!(payload.contains("\"hi\""));
    }

    #[test]
    fn other_windows_receive_sync_envelopes_once() {
        let app = app();
        let (tx, rx) = mpsc::channel();
        app.listen_any(EVT_CHAT_SYNC, move |e| {
            let _ = tx.send(e.payload().to_string());
        });

        let state = app.state::<DesktopState>();
        assert_eq!(state.subscribe(app.handle(), "panel").unwrap(), None);
        // A second subscribe must not start a second forwarder.
        assert_eq!(state.subscribe(app.handle(), "panel").unwrap(), None);

        state
            .hub()
            .endpoint("main")
            .publish(&SyncEnvelope::update("m1", "hello", 7));
        let payload = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(payload.contains("hello"));
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(state.subscribe(app.handle(), "panel").unwrap().unwrap().contains("hello"));
    }
}
