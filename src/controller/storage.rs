//! Disk persistence for per-process message history and the daily cost limit file.
//!
//! Grounded on the teacher's plain, manually-constructed config style
//! ([`crate::cloudllm::config::CloudLLMConfig`]): no config-file parsing crate, just JSON via
//! `serde_json` over `tokio::fs`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::controller::error::ControllerError;
use crate::controller::wire::MagiMessage;

/// Root directory for controller-persisted state, matching
/// `<cwd>/dist/.server/task_messages/<processId>_messages.json`.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub task_messages_dir: PathBuf,
    pub daily_cost_limit_path: PathBuf,
    pub projects_dir: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            task_messages_dir: PathBuf::from("dist/.server/task_messages"),
            daily_cost_limit_path: PathBuf::from("dailyCostLimit.json"),
            projects_dir: PathBuf::from("dist/.server/projects"),
        }
    }
}

impl StoragePaths {
    fn messages_path(&self, process_id: &str) -> PathBuf {
        self.task_messages_dir.join(format!("{process_id}_messages.json"))
    }

    fn project_path(&self, project_id: &str) -> PathBuf {
        self.projects_dir.join(project_id)
    }

    /// Creates the project's working directory. Errors if it already exists.
    pub async fn create_project(&self, project_id: &str) -> Result<(), ControllerError> {
        let path = self.project_path(project_id);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Err(ControllerError::ProtocolViolation(format!("project '{project_id}' already exists")));
        }
        tokio::fs::create_dir_all(&path).await.map_err(ControllerError::Persistence)
    }

    /// Removes a project's working directory, tolerating one that is already gone.
    pub async fn delete_project(&self, project_id: &str) -> Result<(), ControllerError> {
        match tokio::fs::remove_dir_all(self.project_path(project_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ControllerError::Persistence(e)),
        }
    }

    /// Loads a process's full message history, or an empty history if no file exists yet.
    pub async fn load_history(&self, process_id: &str) -> Result<Vec<MagiMessage>, ControllerError> {
        let path = self.messages_path(process_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| ControllerError::ProtocolViolation(format!("corrupt history at {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ControllerError::Persistence(e)),
        }
    }

    /// Overwrites the on-disk history for `process_id` with `history`.
    pub async fn save_history(&self, process_id: &str, history: &[MagiMessage]) -> Result<(), ControllerError> {
        let path = self.messages_path(process_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string(history)
            .map_err(|e| ControllerError::ProtocolViolation(format!("failed to serialize history: {e}")))?;
        tokio::fs::write(&path, serialized).await?;
        Ok(())
    }

    /// Loads the configured daily cost limit, or `None` if the file is absent or has `dailyLimit:
    /// null`.
    pub async fn load_daily_cost_limit(&self) -> Result<Option<f64>, ControllerError> {
        load_daily_cost_limit(&self.daily_cost_limit_path).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCostLimitFile {
    #[serde(rename = "dailyLimit")]
    daily_limit: Option<f64>,
}

async fn load_daily_cost_limit(path: &Path) -> Result<Option<f64>, ControllerError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let parsed: DailyCostLimitFile = serde_json::from_str(&contents)
                .map_err(|e| ControllerError::ProtocolViolation(format!("corrupt {}: {e}", path.display())))?;
            Ok(parsed.daily_limit)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ControllerError::Persistence(e)),
    }
}
