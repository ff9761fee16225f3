//! Configuration for the controller core.
//!
//! Mirrors [`crate::cloudllm::config::CloudLLMConfig`]'s manually-constructed, no-parsing-crate
//! style: callers build this struct directly rather than loading it from a config file format.

/// Global configuration for the controller process.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Port the controller's duplex server listens on; included in the `connect` handshake so a
    /// restarted controller on a new port can be rediscovered by its containers.
    pub port: u16,
    /// `summary_threshold_chars`: content longer than this is eligible for summarization by the
    /// agent-side summary store. Default `8_000`, matching typical single-call context budgets.
    pub summary_threshold_chars: usize,
    /// Path to the `dailyCostLimit.json` file consulted on every cost update.
    pub daily_cost_limit_path: std::path::PathBuf,
    /// Root directory for `<processId>_messages.json` history files.
    pub task_messages_dir: std::path::PathBuf,
    /// Root directory under which each project gets its own working directory.
    pub projects_dir: std::path::PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            summary_threshold_chars: 8_000,
            daily_cost_limit_path: std::path::PathBuf::from("dailyCostLimit.json"),
            task_messages_dir: std::path::PathBuf::from("dist/.server/task_messages"),
            projects_dir: std::path::PathBuf::from("dist/.server/projects"),
        }
    }
}

impl ControllerConfig {
    pub fn storage_paths(&self) -> crate::controller::storage::StoragePaths {
        crate::controller::storage::StoragePaths {
            task_messages_dir: self.task_messages_dir.clone(),
            daily_cost_limit_path: self.daily_cost_limit_path.clone(),
            projects_dir: self.projects_dir.clone(),
        }
    }
}
