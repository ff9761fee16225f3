//! Dispatches inbound [`UpstreamEvent`]s to built-in handlers or a registered custom handler.
//!
//! Grounded on the teacher's hook pattern in `agent.rs` (`on_tool_call`/`on_tool_result` as
//! `Option<Arc<dyn Fn(...) + Send + Sync>>`): custom handlers here follow the same shape, just
//! keyed by event-type name instead of being a single fixed slot.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::controller::process_manager::ProcessManager;
use crate::controller::wire::{DownstreamMessage, Process, ProcessStatus, UpstreamEvent};

/// A custom handler for one event type name. Returning `Some(response)` sends
/// `{type: "<eventType>_response", ...response}` back to the source process and suppresses the
/// built-in behavior for that event.
pub type CustomHandler = Arc<dyn Fn(&str, &UpstreamEvent) -> Option<JsonValue> + Send + Sync>;

/// Runs once, for one process, when that process reports `process_done`.
pub type CompletionHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Runs when the `stop` watchdog fires for a process that failed to terminate on its own.
/// Wired by the communication hub (the thing that can actually deliver a `SystemCommand::Stop`),
/// since the event router itself has no delivery channel.
pub type ForceStopHook = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Creates or deletes a project's on-disk working directory. Wired by the communication hub,
/// the only component holding a [`crate::controller::storage::StoragePaths`].
pub type ProjectHook = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

const STOP_WATCHDOG: Duration = Duration::from_secs(5);

/// Routes inbound events to custom handlers first, then built-in behaviors.
pub struct EventRouter {
    custom_handlers: RwLock<HashMap<String, CustomHandler>>,
    completion_handlers: RwLock<HashMap<String, CompletionHandler>>,
    processes: Arc<ProcessManager>,
    force_stop_hook: RwLock<Option<ForceStopHook>>,
    project_create_hook: RwLock<Option<ProjectHook>>,
    project_delete_hook: RwLock<Option<ProjectHook>>,
}

impl EventRouter {
    pub fn new(processes: Arc<ProcessManager>) -> Self {
        Self {
            custom_handlers: RwLock::new(HashMap::new()),
            completion_handlers: RwLock::new(HashMap::new()),
            processes,
            force_stop_hook: RwLock::new(None),
            project_create_hook: RwLock::new(None),
            project_delete_hook: RwLock::new(None),
        }
    }

    pub async fn register_handler(&self, event_type: impl Into<String>, handler: CustomHandler) {
        self.custom_handlers.write().await.insert(event_type.into(), handler);
    }

    /// Registers a one-shot handler invoked when `process_id` reports `process_done`. Removed
    /// from the registry the moment it runs.
    pub async fn register_completion_handler(&self, process_id: impl Into<String>, handler: CompletionHandler) {
        self.completion_handlers.write().await.insert(process_id.into(), handler);
    }

    /// Wires the action taken when the stop watchdog fires. Set once, after construction, by
    /// whoever owns delivery to the downstream process (the communication hub).
    pub async fn set_force_stop_hook(&self, hook: ForceStopHook) {
        *self.force_stop_hook.write().await = Some(hook);
    }

    /// Wires project directory creation. Set once, after construction, by the communication hub.
    pub async fn set_project_create_hook(&self, hook: ProjectHook) {
        *self.project_create_hook.write().await = Some(hook);
    }

    /// Wires project directory deletion. Set once, after construction, by the communication hub.
    pub async fn set_project_delete_hook(&self, hook: ProjectHook) {
        *self.project_delete_hook.write().await = Some(hook);
    }

    fn event_type_name(event: &UpstreamEvent) -> &'static str {
        match event {
            UpstreamEvent::MessageDelta { .. } => "message_delta",
            UpstreamEvent::MessageComplete { .. } => "message_complete",
            UpstreamEvent::ToolStart { .. } => "tool_start",
            UpstreamEvent::ToolDone { .. } => "tool_done",
            UpstreamEvent::CostUpdate { .. } => "cost_update",
            UpstreamEvent::ProcessStart { .. } => "process_start",
            UpstreamEvent::ProcessRunning => "process_running",
            UpstreamEvent::ProcessUpdated => "process_updated",
            UpstreamEvent::ProcessDone => "process_done",
            UpstreamEvent::ProcessWaiting => "process_waiting",
            UpstreamEvent::ProcessTerminated => "process_terminated",
            UpstreamEvent::ProcessFailed { .. } => "process_failed",
            UpstreamEvent::ProjectCreate { .. } => "project_create",
            UpstreamEvent::ProjectDelete { .. } => "project_delete",
            UpstreamEvent::CommandStart { .. } => "command_start",
            UpstreamEvent::GitPullRequest { .. } => "git_pull_request",
            UpstreamEvent::SystemStatus { .. } => "system_status",
            UpstreamEvent::AgentStart { .. } => "agent_start",
            UpstreamEvent::AgentUpdated { .. } => "agent_updated",
            UpstreamEvent::Error { .. } => "error",
            UpstreamEvent::Unknown => "unknown",
        }
    }

    /// Routes one event originating from `source_process_id`. Returns the downstream messages
    /// the caller (communication hub) should deliver as a result.
    pub async fn route(&self, source_process_id: &str, event: &UpstreamEvent) -> Vec<RoutedMessage> {
        let event_type = Self::event_type_name(event);

        if let Some(handler) = self.custom_handlers.read().await.get(event_type) {
            if let Some(response) = handler(source_process_id, event) {
                let mut fields = HashMap::new();
                if let JsonValue::Object(map) = response {
                    fields.extend(map.into_iter());
                }
                return vec![RoutedMessage {
                    target_process_id: source_process_id.to_string(),
                    message: DownstreamMessage::EventTypeResponse { event_type: event_type.to_string(), fields },
                }];
            }
        }

        self.dispatch_builtin(source_process_id, event).await
    }

    async fn dispatch_builtin(&self, source_process_id: &str, event: &UpstreamEvent) -> Vec<RoutedMessage> {
        match event {
            UpstreamEvent::CommandStart { target_process_id, command } => {
                let core_id = self.processes.core_process_id().await;
                if command == "stop" && core_id.as_deref() == Some(target_process_id.as_str()) {
                    return vec![RoutedMessage {
                        target_process_id: source_process_id.to_string(),
                        message: DownstreamMessage::SystemMessage { message: "Can not stop the core process.".to_string() },
                    }];
                }

                let mut args = serde_json::Map::new();
                args.insert("sourceProcessId".to_string(), JsonValue::String(source_process_id.to_string()));
                let forwarded = vec![RoutedMessage {
                    target_process_id: target_process_id.clone(),
                    message: DownstreamMessage::Command { command: command.clone(), args: JsonValue::Object(args), content: None },
                }];

                if command == "stop" {
                    let hook = self.force_stop_hook.read().await.clone();
                    self.processes.arm_stop_watchdog(target_process_id.clone(), STOP_WATCHDOG, move |pid| async move {
                        if let Some(hook) = hook {
                            hook(pid).await;
                        }
                    });
                }
                forwarded
            }
            UpstreamEvent::ProcessFailed { error } => {
                self.processes.mark_status(source_process_id, ProcessStatus::Failed).await;
                log::error!("process '{source_process_id}' failed: {error}");
                vec![RoutedMessage {
                    target_process_id: self.processes.core_process_id().await.unwrap_or_default(),
                    message: DownstreamMessage::SystemMessage { message: format!("process {source_process_id} failed: {error}") },
                }]
            }
            UpstreamEvent::ProcessTerminated => {
                self.processes.mark_status(source_process_id, ProcessStatus::Terminated).await;
                let core_id = self.processes.core_process_id().await;
                if core_id.as_deref() == Some(source_process_id) {
                    Vec::new()
                } else {
                    vec![RoutedMessage {
                        target_process_id: core_id.unwrap_or_default(),
                        message: DownstreamMessage::ProcessEvent {
                            process_id: source_process_id.to_string(),
                            event: serde_json::json!({ "type": "process_terminated" }),
                        },
                    }]
                }
            }
            UpstreamEvent::ProcessRunning | UpstreamEvent::ProcessUpdated | UpstreamEvent::ProcessDone | UpstreamEvent::ProcessWaiting => {
                let status = match event {
                    UpstreamEvent::ProcessRunning => ProcessStatus::Running,
                    UpstreamEvent::ProcessUpdated => ProcessStatus::Running,
                    UpstreamEvent::ProcessDone => ProcessStatus::Completed,
                    UpstreamEvent::ProcessWaiting => ProcessStatus::Waiting,
                    _ => unreachable!(),
                };
                self.processes.mark_status(source_process_id, status).await;

                if matches!(event, UpstreamEvent::ProcessDone) {
                    if let Some(handler) = self.completion_handlers.write().await.remove(source_process_id) {
                        handler(source_process_id);
                    }
                }

                let core_id = self.processes.core_process_id().await;
                vec![RoutedMessage {
                    target_process_id: core_id.unwrap_or_default(),
                    message: DownstreamMessage::ProcessEvent {
                        process_id: source_process_id.to_string(),
                        event: serde_json::json!({ "type": Self::event_type_name(event) }),
                    },
                }]
            }
            UpstreamEvent::ProcessStart { agent_process } => {
                let process_id = agent_process.get("processId").or_else(|| agent_process.get("process_id")).and_then(|v| v.as_str());
                match process_id {
                    Some(process_id) => {
                        let is_core = agent_process.get("isCore").and_then(|v| v.as_bool()).unwrap_or(false);
                        self.processes.create_process(Process::new(process_id, 0, is_core).with_parent(source_process_id)).await;
                        log::info!("process '{source_process_id}' spawned child '{process_id}'");
                        Vec::new()
                    }
                    None => {
                        log::warn!("process_start from '{source_process_id}' missing processId");
                        Vec::new()
                    }
                }
            }
            UpstreamEvent::ProjectCreate { project_id } => {
                let core_id = self.processes.core_process_id().await.unwrap_or_default();
                let create_hook = self.project_create_hook.read().await.clone();
                match create_hook {
                    Some(create) => match create(project_id.clone()).await {
                        Ok(()) => vec![RoutedMessage {
                            target_process_id: core_id,
                            message: DownstreamMessage::ProjectUpdate {
                                project_id: project_id.clone(),
                                message: format!("Project '{project_id}' created"),
                                failed: None,
                            },
                        }],
                        Err(e) => {
                            log::error!("failed to create project '{project_id}': {e}");
                            if let Some(delete) = self.project_delete_hook.read().await.clone() {
                                let _ = delete(project_id.clone()).await;
                            }
                            vec![RoutedMessage {
                                target_process_id: core_id,
                                message: DownstreamMessage::ProjectUpdate { project_id: project_id.clone(), message: e, failed: Some(true) },
                            }]
                        }
                    },
                    None => {
                        log::warn!("no project create hook wired; ignoring project_create for '{project_id}'");
                        Vec::new()
                    }
                }
            }
            UpstreamEvent::ProjectDelete { project_id } => {
                let core_id = self.processes.core_process_id().await.unwrap_or_default();
                let delete_hook = self.project_delete_hook.read().await.clone();
                match delete_hook {
                    Some(delete) => {
                        let message = match delete(project_id.clone()).await {
                            Ok(()) => format!("Project '{project_id}' deleted"),
                            Err(e) => {
                                log::error!("failed to delete project '{project_id}': {e}");
                                e
                            }
                        };
                        vec![RoutedMessage {
                            target_process_id: core_id,
                            message: DownstreamMessage::ProjectDeleteComplete { project_id: project_id.clone(), message },
                        }]
                    }
                    None => {
                        log::warn!("no project delete hook wired; ignoring project_delete for '{project_id}'");
                        Vec::new()
                    }
                }
            }
            UpstreamEvent::GitPullRequest { process_id, project_id, branch, message, patch_id } => {
                vec![RoutedMessage {
                    target_process_id: "process-manager".to_string(),
                    message: DownstreamMessage::ProcessEvent {
                        process_id: process_id.clone(),
                        event: serde_json::json!({
                            "type": "git_pull_request",
                            "projectId": project_id,
                            "branch": branch,
                            "message": message,
                            "patchId": patch_id,
                        }),
                    },
                }]
            }
            UpstreamEvent::ToolStart { tool_calls, tool_call } => {
                let calls: Vec<&JsonValue> = if !tool_calls.is_empty() {
                    tool_calls.iter().collect()
                } else {
                    tool_call.iter().collect()
                };
                for call in calls {
                    let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("");
                    if name.starts_with("talk_to_") {
                        let args = call.get("arguments").cloned().unwrap_or(JsonValue::Null);
                        let has_message = args.get("message").and_then(|v| v.as_str()).is_some();
                        let has_affect = args.get("affect").is_some();
                        if has_message && has_affect {
                            log::info!("fire-and-forget speech call from '{source_process_id}' via tool '{name}'");
                        }
                    }
                }
                Vec::new()
            }
            UpstreamEvent::SystemStatus { status } => {
                log::debug!("system:status from '{source_process_id}': {status}");
                Vec::new()
            }
            UpstreamEvent::Unknown => {
                log::warn!("unknown event type from '{source_process_id}'");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

/// One downstream message produced by routing, addressed to a specific process.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub target_process_id: String,
    pub message: DownstreamMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn command_start_targeting_core_stop_is_rejected() {
        let processes = Arc::new(ProcessManager::new());
        processes.set_core_process_id("core-1".to_string()).await;
        let router = EventRouter::new(processes);

        let routed = router
            .route("child-1", &UpstreamEvent::CommandStart { target_process_id: "core-1".to_string(), command: "stop".to_string() })
            .await;

        assert_eq!(routed.len(), 1);
        assert!(matches!(routed[0].message, DownstreamMessage::SystemMessage { .. }));
    }

    #[tokio::test]
    async fn command_start_forwards_with_source_process_id() {
        let processes = Arc::new(ProcessManager::new());
        processes.set_core_process_id("core-1".to_string()).await;
        let router = EventRouter::new(processes);

        let routed = router
            .route("child-1", &UpstreamEvent::CommandStart { target_process_id: "child-2".to_string(), command: "pause".to_string() })
            .await;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].target_process_id, "child-2");
    }

    #[tokio::test]
    async fn custom_handler_suppresses_builtin_and_emits_response() {
        let processes = Arc::new(ProcessManager::new());
        let router = EventRouter::new(processes);
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();
        router
            .register_handler(
                "system_status",
                Arc::new(move |_src, _event| {
                    called_clone.store(true, Ordering::SeqCst);
                    Some(serde_json::json!({ "ack": true }))
                }),
            )
            .await;

        let routed = router.route("p1", &UpstreamEvent::SystemStatus { status: JsonValue::Null }).await;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(routed.len(), 1);
        assert!(matches!(routed[0].message, DownstreamMessage::EventTypeResponse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_watchdog_invokes_force_stop_hook_on_timeout() {
        let processes = Arc::new(ProcessManager::new());
        processes.set_core_process_id("core-1".to_string()).await;
        processes.create_process(crate::controller::wire::Process::new("child-2", 0, false)).await;
        let router = EventRouter::new(processes);

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        router
            .set_force_stop_hook(Arc::new(move |pid| {
                let fired_clone = fired_clone.clone();
                Box::pin(async move {
                    assert_eq!(pid, "child-2");
                    fired_clone.store(true, Ordering::SeqCst);
                })
            }))
            .await;

        router
            .route("child-1", &UpstreamEvent::CommandStart { target_process_id: "child-2".to_string(), command: "stop".to_string() })
            .await;

        tokio::time::advance(STOP_WATCHDOG + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn process_start_spawns_child_with_parent() {
        let processes = Arc::new(ProcessManager::new());
        let router = EventRouter::new(Arc::clone(&processes));

        let routed = router
            .route("parent-1", &UpstreamEvent::ProcessStart { agent_process: serde_json::json!({ "processId": "child-1" }) })
            .await;

        assert!(routed.is_empty());
        let child = processes.get_process("child-1").await.unwrap();
        assert_eq!(child.parent_process_id, Some("parent-1".to_string()));
        assert!(!child.is_core);
    }

    #[tokio::test]
    async fn process_start_missing_process_id_is_ignored() {
        let processes = Arc::new(ProcessManager::new());
        let router = EventRouter::new(Arc::clone(&processes));

        let routed = router.route("parent-1", &UpstreamEvent::ProcessStart { agent_process: serde_json::json!({}) }).await;

        assert!(routed.is_empty());
    }

    #[tokio::test]
    async fn process_done_invokes_and_removes_completion_handler() {
        let processes = Arc::new(ProcessManager::new());
        processes.create_process(crate::controller::wire::Process::new("p1", 0, false)).await;
        let router = EventRouter::new(processes);

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        router.register_completion_handler("p1", Arc::new(move |_pid| { calls_clone.fetch_add(1, Ordering::SeqCst); })).await;

        router.route("p1", &UpstreamEvent::ProcessDone).await;
        router.route("p1", &UpstreamEvent::ProcessDone).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn project_create_without_hook_is_a_noop() {
        let processes = Arc::new(ProcessManager::new());
        let router = EventRouter::new(processes);

        let routed = router.route("p1", &UpstreamEvent::ProjectCreate { project_id: "proj-1".to_string() }).await;

        assert!(routed.is_empty());
    }

    #[tokio::test]
    async fn project_create_success_notifies_core_with_project_update() {
        let processes = Arc::new(ProcessManager::new());
        processes.set_core_process_id("core-1".to_string()).await;
        let router = EventRouter::new(processes);
        router.set_project_create_hook(Arc::new(|_project_id| Box::pin(async { Ok(()) }))).await;

        let routed = router.route("p1", &UpstreamEvent::ProjectCreate { project_id: "proj-1".to_string() }).await;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].target_process_id, "core-1");
        match &routed[0].message {
            DownstreamMessage::ProjectUpdate { project_id, failed, .. } => {
                assert_eq!(project_id, "proj-1");
                assert_eq!(*failed, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn project_create_failure_cleans_up_and_flags_failed() {
        let processes = Arc::new(ProcessManager::new());
        processes.set_core_process_id("core-1".to_string()).await;
        let router = EventRouter::new(processes);
        router.set_project_create_hook(Arc::new(|_project_id| Box::pin(async { Err("disk full".to_string()) }))).await;

        let deleted = Arc::new(AtomicBool::new(false));
        let deleted_clone = deleted.clone();
        router
            .set_project_delete_hook(Arc::new(move |_project_id| {
                let deleted_clone = deleted_clone.clone();
                Box::pin(async move {
                    deleted_clone.store(true, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;

        let routed = router.route("p1", &UpstreamEvent::ProjectCreate { project_id: "proj-1".to_string() }).await;

        assert!(deleted.load(Ordering::SeqCst));
        assert_eq!(routed.len(), 1);
        match &routed[0].message {
            DownstreamMessage::ProjectUpdate { failed, message, .. } => {
                assert_eq!(*failed, Some(true));
                assert_eq!(message, "disk full");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn project_delete_without_hook_is_a_noop() {
        let processes = Arc::new(ProcessManager::new());
        let router = EventRouter::new(processes);

        let routed = router.route("p1", &UpstreamEvent::ProjectDelete { project_id: "proj-1".to_string() }).await;

        assert!(routed.is_empty());
    }

    #[tokio::test]
    async fn project_delete_success_notifies_core_with_delete_complete() {
        let processes = Arc::new(ProcessManager::new());
        processes.set_core_process_id("core-1".to_string()).await;
        let router = EventRouter::new(processes);
        router.set_project_delete_hook(Arc::new(|_project_id| Box::pin(async { Ok(()) }))).await;

        let routed = router.route("p1", &UpstreamEvent::ProjectDelete { project_id: "proj-1".to_string() }).await;

        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].target_process_id, "core-1");
        assert!(matches!(&routed[0].message, DownstreamMessage::ProjectDeleteComplete { project_id, .. } if project_id == "proj-1"));
    }
}
