//! Tracks the lifecycle of agent processes and arms the `stop` watchdog.
//!
//! Grounded on the teacher's `Arc<RwLock<_>>`-keyed registries (e.g.
//! [`crate::cloudllm::tool_catalog::DynamicToolCatalog`]'s `agent_overlay`): a shared map guarded
//! by an async `RwLock`, mutated by short-lived critical sections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::controller::error::ControllerError;
use crate::controller::wire::{Process, ProcessStatus};

/// Owns the registry of known [`Process`] records and the identity of the designated core
/// process.
pub struct ProcessManager {
    processes: RwLock<HashMap<String, Process>>,
    core_process_id: RwLock<Option<String>>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self { processes: RwLock::new(HashMap::new()), core_process_id: RwLock::new(None) }
    }

    pub async fn set_core_process_id(&self, process_id: String) {
        *self.core_process_id.write().await = Some(process_id);
    }

    pub async fn core_process_id(&self) -> Option<String> {
        self.core_process_id.read().await.clone()
    }

    /// Registers a newly created process, per a `createAgentProcess`/`process_start` request.
    pub async fn create_process(&self, process: Process) {
        let is_core = process.is_core;
        let process_id = process.process_id.clone();
        self.processes.write().await.insert(process_id.clone(), process);
        if is_core {
            self.set_core_process_id(process_id).await;
        }
    }

    pub async fn get_process(&self, process_id: &str) -> Result<Process, ControllerError> {
        self.processes
            .read()
            .await
            .get(process_id)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownProcess(process_id.to_string()))
    }

    pub async fn list_processes(&self) -> Vec<Process> {
        self.processes.read().await.values().cloned().collect()
    }

    /// Transitions a process's status, creating a placeholder record if it is unknown (a process
    /// may report status before the manager has synchronously observed its creation).
    pub async fn mark_status(&self, process_id: &str, status: ProcessStatus) {
        let mut processes = self.processes.write().await;
        match processes.get_mut(process_id) {
            Some(process) => process.status = status,
            None => {
                log::warn!("status update for untracked process '{process_id}'");
            }
        }
    }

    pub async fn remove_process(&self, process_id: &str) {
        self.processes.write().await.remove(process_id);
    }

    /// Schedules a force-stop check in `delay` unless the target has already reached a terminal
    /// status, matching the 5s `stop` watchdog. `on_force_stop` runs after the local status is
    /// marked `Terminated`, so callers can push a downstream `SystemCommand::Stop` without this
    /// manager needing to know how messages actually reach the process.
    pub fn arm_stop_watchdog<F, Fut>(self: &Arc<Self>, target_process_id: String, delay: Duration, on_force_stop: F)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let should_force_stop = match manager.get_process(&target_process_id).await {
                Ok(process) => !process.is_terminal(),
                Err(_) => false,
            };
            if should_force_stop {
                log::warn!("process '{target_process_id}' did not terminate within watchdog window, forcing stop");
                manager.mark_status(&target_process_id, ProcessStatus::Terminated).await;
                on_force_stop(target_process_id).await;
            }
        });
    }
}

impl ProcessManager {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}
