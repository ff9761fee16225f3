//! Accepts per-process duplex connections, tracks their message history and cost state, rewrites
//! sandbox paths, and forwards inbound events to the [`EventRouter`].
//!
//! The duplex upgrade is `axum`'s WebSocket support (`axum::extract::ws`), promoted from the
//! teacher's `mcp-server`-feature-gated dependency to an unconditional one since this hub needs
//! it regardless of MCP tooling. Broadcast fan-out to UI subscribers uses `tokio::sync::broadcast`,
//! matching the `Arc<RwLock<_>>`-heavy concurrency idioms already used throughout the crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::controller::cost_aggregator::CostAggregator;
use crate::controller::error::ControllerError;
use crate::controller::event_router::EventRouter;
use crate::controller::process_manager::ProcessManager;
use crate::controller::storage::StoragePaths;
use crate::controller::wire::{CostUsage, DownstreamMessage, GlobalCostSnapshot, MagiMessage, SystemCommandKind, UpstreamEvent};

/// The reserved path segment rejected as a `processId` (see `extract_process_id`).
const RESERVED_PROCESS_ID: &str = "task";

/// One live (or recently disconnected) duplex channel for a process, plus its durable history.
pub struct ContainerConnection {
    /// `None` between a disconnect and reconnect; history survives regardless.
    pub sender: Option<mpsc::UnboundedSender<WsMessage>>,
    pub last_message_at_ms: i64,
    pub history: Vec<MagiMessage>,
}

impl ContainerConnection {
    fn new() -> Self {
        Self { sender: None, last_message_at_ms: 0, history: Vec::new() }
    }
}

/// UI-facing publish channels: `cost:info`, `system:status`, `process:message`.
pub struct UiChannels {
    pub cost_info: broadcast::Sender<GlobalCostSnapshot>,
    pub system_status: broadcast::Sender<serde_json::Value>,
    pub process_message: broadcast::Sender<(String, MagiMessage)>,
}

impl Default for UiChannels {
    fn default() -> Self {
        let (cost_info, _) = broadcast::channel(256);
        let (system_status, _) = broadcast::channel(256);
        let (process_message, _) = broadcast::channel(1024);
        Self { cost_info, system_status, process_message }
    }
}

/// Shared state backing the communication hub: connection registry, persistence, cost
/// aggregation, event routing, and UI fan-out.
pub struct CommunicationHub {
    connections: RwLock<HashMap<String, ContainerConnection>>,
    storage: StoragePaths,
    cost_aggregator: Arc<CostAggregator>,
    event_router: Arc<EventRouter>,
    processes: Arc<ProcessManager>,
    ui: UiChannels,
    controller_port: u16,
    /// Counts appends per process, used to decide when to flush history to disk (every 5th).
    append_counters: RwLock<HashMap<String, u64>>,
    clock_ms: AtomicI64,
}

impl CommunicationHub {
    /// Builds the hub and wires its [`EventRouter`]'s stop watchdog back to
    /// [`CommunicationHub::send_system_command`], so a process that ignores a `stop` command for
    /// 5s gets a forced `SystemCommand::Stop` rather than just a locally-marked `Terminated`
    /// status. Returns `Arc` because that wiring closure needs a handle to `self`, and because
    /// every other caller in this module already requires `Arc<CommunicationHub>` anyway.
    pub async fn new(
        storage: StoragePaths,
        cost_aggregator: Arc<CostAggregator>,
        event_router: Arc<EventRouter>,
        processes: Arc<ProcessManager>,
        controller_port: u16,
    ) -> Arc<Self> {
        let hub = Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            storage,
            cost_aggregator,
            event_router: Arc::clone(&event_router),
            processes,
            ui: UiChannels::default(),
            controller_port,
            append_counters: RwLock::new(HashMap::new()),
            clock_ms: AtomicI64::new(0),
        });

        let hook_hub = Arc::clone(&hub);
        event_router
            .set_force_stop_hook(Arc::new(move |process_id: String| {
                let hook_hub = Arc::clone(&hook_hub);
                Box::pin(async move {
                    hook_hub.send_system_command(&process_id, SystemCommandKind::Stop).await;
                })
            }))
            .await;

        let create_hub = Arc::clone(&hub);
        event_router
            .set_project_create_hook(Arc::new(move |project_id: String| {
                let create_hub = Arc::clone(&create_hub);
                Box::pin(async move { create_hub.storage.create_project(&project_id).await.map_err(|e| e.to_string()) })
            }))
            .await;

        let delete_hub = Arc::clone(&hub);
        event_router
            .set_project_delete_hook(Arc::new(move |project_id: String| {
                let delete_hub = Arc::clone(&delete_hub);
                Box::pin(async move { delete_hub.storage.delete_project(&project_id).await.map_err(|e| e.to_string()) })
            }))
            .await;

        hub
    }

    pub fn ui_channels(&self) -> &UiChannels {
        &self.ui
    }

    /// Monotonic logical clock, advanced by callers feeding real wall-clock ms in (kept external
    /// so tests can drive time deterministically).
    pub fn set_clock_ms(&self, now_ms: i64) {
        self.clock_ms.store(now_ms, Ordering::SeqCst);
    }

    fn now_ms(&self) -> i64 {
        self.clock_ms.load(Ordering::SeqCst)
    }

    /// Extracts `processId` from the last path segment, rejecting a missing or reserved id.
    pub fn extract_process_id(path: &str) -> Result<String, ControllerError> {
        let segment = path.rsplit('/').next().unwrap_or("").trim();
        if segment.is_empty() || segment == RESERVED_PROCESS_ID {
            return Err(ControllerError::ProtocolViolation(format!("invalid processId segment '{segment}'")));
        }
        Ok(segment.to_string())
    }

    /// Accepts a new connection for `process_id`, preserving prior history if one exists, sends
    /// the `connect` handshake, and registers the outbound sender.
    pub async fn accept_connection(
        &self,
        process_id: &str,
        sender: mpsc::UnboundedSender<WsMessage>,
        core_process_id: &str,
    ) -> Result<(), ControllerError> {
        {
            let mut connections = self.connections.write().await;
            let connection = connections.entry(process_id.to_string()).or_insert_with(ContainerConnection::new);
            if connection.history.is_empty() {
                connection.history = self.storage.load_history(process_id).await?;
            }
            connection.sender = Some(sender);
            connection.last_message_at_ms = self.now_ms();
        }

        let connect = DownstreamMessage::Connect {
            timestamp: self.now_ms(),
            controller_port: self.controller_port,
            core_process_id: core_process_id.to_string(),
        };
        self.send_to(process_id, &connect).await;
        Ok(())
    }

    /// Marks a connection's sender as gone without dropping its history, per "history survives
    /// disconnects".
    pub async fn disconnect(&self, process_id: &str) {
        if let Some(connection) = self.connections.write().await.get_mut(process_id) {
            connection.sender = None;
        }
        let history_snapshot = self.connections.read().await.get(process_id).map(|c| c.history.clone());
        if let Some(history) = history_snapshot {
            if let Err(e) = self.storage.save_history(process_id, &history).await {
                log::error!("failed to persist history for '{process_id}' on disconnect: {e}");
            }
        }
    }

    /// Handles one inbound frame: validates `processId`, appends to history, flushes every 5th
    /// message, tracks cost, rewrites paths, and routes the event.
    pub async fn handle_inbound(&self, channel_process_id: &str, frame: MagiMessage) {
        if frame.process_id != channel_process_id {
            log::warn!("dropping frame: processId '{}' does not match channel '{channel_process_id}'", frame.process_id);
            return;
        }

        let should_flush = {
            let mut connections = self.connections.write().await;
            let connection = connections.entry(channel_process_id.to_string()).or_insert_with(ContainerConnection::new);
            connection.history.push(frame.clone());
            connection.last_message_at_ms = self.now_ms();

            let mut counters = self.append_counters.write().await;
            let count = counters.entry(channel_process_id.to_string()).or_insert(0);
            *count += 1;
            *count % 5 == 0
        };

        if should_flush {
            let history_snapshot = self.connections.read().await.get(channel_process_id).map(|c| c.history.clone());
            if let Some(history) = history_snapshot {
                if let Err(e) = self.storage.save_history(channel_process_id, &history).await {
                    log::error!("failed to flush history for '{channel_process_id}': {e}");
                }
            }
        }

        if let UpstreamEvent::CostUpdate { usage } = &frame.event {
            self.handle_cost_update(channel_process_id, usage).await;
        }

        let rewritten = rewrite_event_paths(&frame.event);
        self.broadcast_process_message(channel_process_id, MagiMessage::new(channel_process_id, rewritten));

        let routed = self.event_router.route(channel_process_id, &frame.event).await;
        for message in routed {
            self.send_to(&message.target_process_id, &message.message).await;
        }
    }

    async fn handle_cost_update(&self, process_id: &str, usage: &CostUsage) {
        let timestamp_ms = usage.timestamp.unwrap_or_else(|| self.now_ms());
        let cost = usage.cost.unwrap_or(0.0);
        self.cost_aggregator.record(process_id, &usage.model, cost, usage.input_tokens, usage.output_tokens, timestamp_ms);

        let snapshot = self.cost_aggregator.snapshot(self.now_ms());
        let _ = self.ui.cost_info.send(snapshot.clone());

        match self.cost_aggregator.evaluate_daily_limit(&self.storage, &snapshot, self.now_ms()).await {
            Ok(crate::controller::cost_aggregator::LimitCheckOutcome::OverLimit { message })
            | Ok(crate::controller::cost_aggregator::LimitCheckOutcome::Approaching { message }) => {
                let _ = self.ui.system_status.send(serde_json::json!({ "message": message }));
            }
            Ok(_) => {}
            Err(e) => log::error!("failed to evaluate daily cost limit: {e}"),
        }
    }

    fn broadcast_process_message(&self, process_id: &str, message: MagiMessage) {
        let _ = self.ui.process_message.send((process_id.to_string(), message));
    }

    /// Sends a text command, preserving a structured content array when `content` was itself a
    /// JSON envelope carrying `contentArray`.
    pub async fn send_command(&self, process_id: &str, command: &str, args: serde_json::Value, content_array: Option<Vec<serde_json::Value>>) -> bool {
        let message = DownstreamMessage::Command { command: command.to_string(), args, content: content_array };
        self.send_to(process_id, &message).await
    }

    pub async fn send_system_command(&self, process_id: &str, command: SystemCommandKind) -> bool {
        self.send_to(process_id, &DownstreamMessage::SystemCommand { command }).await
    }

    async fn send_to(&self, process_id: &str, message: &DownstreamMessage) -> bool {
        let connections = self.connections.read().await;
        let sender = match connections.get(process_id).and_then(|c| c.sender.as_ref()) {
            Some(sender) => sender,
            None => {
                log::warn!("no live connection for '{process_id}'");
                return false;
            }
        };
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to serialize downstream message for '{process_id}': {e}");
                return false;
            }
        };
        match sender.send(WsMessage::Text(payload.into())) {
            Ok(()) => true,
            Err(e) => {
                log::error!("send failed for '{process_id}': {e}");
                false
            }
        }
    }
}

/// Rewrites `sandbox:/magi_output/` and bare `sandbox:` prefixes, and markdown-links bare
/// `/magi_output/...<image-ext>` URLs, within the textual payload of an event (and within
/// `tool_done` results, via their `output` field when the result is an object).
fn rewrite_event_paths(event: &UpstreamEvent) -> UpstreamEvent {
    match event {
        UpstreamEvent::MessageDelta { content, message_id, order, thinking_content } => UpstreamEvent::MessageDelta {
            content: rewrite_sandbox_and_image_paths(content),
            message_id: message_id.clone(),
            order: *order,
            thinking_content: thinking_content.clone(),
        },
        UpstreamEvent::MessageComplete { content, message_id, thinking_content } => UpstreamEvent::MessageComplete {
            content: rewrite_sandbox_and_image_paths(content),
            message_id: message_id.clone(),
            thinking_content: thinking_content.clone(),
        },
        UpstreamEvent::ToolDone { tool_calls, results } => {
            UpstreamEvent::ToolDone { tool_calls: tool_calls.clone(), results: rewrite_results_value(results) }
        }
        other => other.clone(),
    }
}

fn rewrite_results_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(rewrite_sandbox_and_image_paths(s)),
        serde_json::Value::Object(map) => {
            let mut out = map.clone();
            if let Some(serde_json::Value::String(output)) = map.get("output") {
                out.insert("output".to_string(), serde_json::Value::String(rewrite_sandbox_and_image_paths(output)));
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];

/// Idempotent: a token already wrapped as `[/magi_output/...](/magi_output/...)` no longer starts
/// with `/magi_output/` so a second pass leaves it untouched.
fn rewrite_sandbox_and_image_paths(text: &str) -> String {
    let unprefixed = text.replace("sandbox:/magi_output/", "/magi_output/").replace("sandbox:", "");
    unprefixed
        .split(' ')
        .map(|token| {
            if token.starts_with("/magi_output/") {
                if let Some(ext) = token.rsplit('.').next() {
                    if IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                        return format!("[{token}]({token})");
                    }
                }
            }
            token.to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the `axum` router exposing the WebSocket upgrade endpoint at `/ws/*processId`.
pub fn router(hub: Arc<CommunicationHub>, core_process_id: Arc<str>) -> Router {
    Router::new().route("/ws/{*process_id}", get(ws_upgrade_handler)).with_state((hub, core_process_id))
}

async fn ws_upgrade_handler(
    State((hub, core_process_id)): State<(Arc<CommunicationHub>, Arc<str>)>,
    Path(path): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match CommunicationHub::extract_process_id(&path) {
        Ok(process_id) => ws.on_upgrade(move |socket| handle_socket(hub, process_id, core_process_id, socket)),
        Err(e) => {
            log::warn!("rejecting websocket upgrade: {e}");
            Response::builder().status(400).body(axum::body::Body::from(e.to_string())).unwrap()
        }
    }
}

async fn handle_socket(hub: Arc<CommunicationHub>, process_id: String, core_process_id: Arc<str>, socket: WebSocket) {
    let (mut ws_sink, mut ws_stream) = futures_util::StreamExt::split(socket);
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    if let Err(e) = hub.accept_connection(&process_id, tx, &core_process_id).await {
        log::error!("failed to accept connection for '{process_id}': {e}");
        return;
    }

    let writer_process_id = process_id.clone();
    let writer = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(message) = rx.recv().await {
            if ws_sink.send(message).await.is_err() {
                log::warn!("write failed for '{writer_process_id}', closing");
                break;
            }
        }
    });

    use futures_util::StreamExt;
    while let Some(Ok(frame)) = ws_stream.next().await {
        if let WsMessage::Text(text) = frame {
            match serde_json::from_str::<MagiMessage>(&text) {
                Ok(message) => hub.handle_inbound(&process_id, message).await,
                Err(e) => log::warn!("dropping malformed frame from '{process_id}': {e}"),
            }
        }
    }

    writer.abort();
    hub.disconnect(&process_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_process_id_from_trailing_segment() {
        assert_eq!(CommunicationHub::extract_process_id("/ws/abc-123").unwrap(), "abc-123");
    }

    #[test]
    fn rejects_reserved_task_segment() {
        assert!(CommunicationHub::extract_process_id("/ws/task").is_err());
    }

    #[test]
    fn rejects_empty_segment() {
        assert!(CommunicationHub::extract_process_id("/ws/").is_err());
    }

    #[test]
    fn rewrites_sandbox_magi_output_prefix() {
        let out = rewrite_sandbox_and_image_paths("see sandbox:/magi_output/foo/bar.png for detail");
        assert_eq!(out, "see [/magi_output/foo/bar.png](/magi_output/foo/bar.png) for detail");
        assert!(!out.contains("sandbox:"));
    }

    #[test]
    fn strips_bare_sandbox_prefix_without_rewriting() {
        let out = rewrite_sandbox_and_image_paths("ran sandbox:/bin/ls");
        assert_eq!(out, "ran /bin/ls");
    }

    #[test]
    fn rewriting_is_idempotent() {
        let once = rewrite_sandbox_and_image_paths("sandbox:/magi_output/a.png");
        let twice = rewrite_sandbox_and_image_paths(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn non_image_magi_output_path_is_left_bare() {
        let out = rewrite_sandbox_and_image_paths("/magi_output/report.pdf");
        assert_eq!(out, "/magi_output/report.pdf");
    }

    #[tokio::test]
    async fn new_wires_force_stop_hook_to_send_system_command() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StoragePaths {
            task_messages_dir: tmp.path().to_path_buf(),
            daily_cost_limit_path: tmp.path().join("dailyCostLimit.json"),
            projects_dir: tmp.path().join("projects"),
        };
        let cost_aggregator = Arc::new(CostAggregator::new(0));
        let processes = ProcessManager::shared();
        processes.create_process(crate::controller::wire::Process::new("child-1", 0, false)).await;
        let event_router = Arc::new(EventRouter::new(Arc::clone(&processes)));
        let hub = CommunicationHub::new(storage, cost_aggregator, Arc::clone(&event_router), processes, 0).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        hub.accept_connection("child-1", tx, "core-1").await.unwrap();
        let _ = rx.recv().await;

        let routed = event_router
            .route("source", &UpstreamEvent::CommandStart { target_process_id: "child-1".to_string(), command: "stop".to_string() })
            .await;
        for message in routed {
            hub.send_to(&message.target_process_id, &message.message).await;
        }
        let _ = rx.recv().await;

        tokio::time::pause();
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        let forced = rx.recv().await.expect("hub should forward a forced SystemCommand::Stop");
        if let WsMessage::Text(text) = forced {
            assert!(text.contains("\"stop\"") || text.contains("Stop"));
        } else {
            panic!("expected a text frame");
        }
    }
}
