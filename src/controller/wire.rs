//! Wire protocol types exchanged between the controller and its agent-process containers, plus
//! the process/cost bookkeeping records the hub maintains per connection.
//!
//! Grounded in shape on [`crate::cloudllm::streaming::StreamingEvent`] (tagged event enum, one
//! variant per wire event kind) but this taxonomy is the *transport* envelope — `processId` +
//! tagged `event` — rather than the Agent Runtime's internal streaming contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Lifecycle state of one agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Waiting,
    Completed,
    Failed,
    Terminated,
}

/// One agent process tracked by the [`crate::controller::process_manager::ProcessManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub process_id: String,
    pub status: ProcessStatus,
    pub parent_process_id: Option<String>,
    pub created_at_ms: i64,
    pub last_message_at_ms: i64,
    pub is_core: bool,
}

impl Process {
    pub fn new(process_id: impl Into<String>, created_at_ms: i64, is_core: bool) -> Self {
        let created_at_ms = created_at_ms;
        Self {
            process_id: process_id.into(),
            status: ProcessStatus::Starting,
            parent_process_id: None,
            created_at_ms,
            last_message_at_ms: created_at_ms,
            is_core,
        }
    }

    pub fn with_parent(mut self, parent_process_id: impl Into<String>) -> Self {
        self.parent_process_id = Some(parent_process_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Terminated)
    }
}

/// Upstream (container → controller) event kinds, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamEvent {
    MessageDelta {
        content: String,
        message_id: String,
        order: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_content: Option<String>,
    },
    MessageComplete {
        content: String,
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_content: Option<String>,
    },
    ToolStart {
        #[serde(default)]
        tool_calls: Vec<JsonValue>,
        #[serde(default)]
        tool_call: Option<JsonValue>,
    },
    ToolDone {
        tool_calls: Vec<JsonValue>,
        results: JsonValue,
    },
    CostUpdate {
        usage: CostUsage,
    },
    ProcessStart {
        agent_process: JsonValue,
    },
    ProcessRunning,
    ProcessUpdated,
    ProcessDone,
    ProcessWaiting,
    ProcessTerminated,
    ProcessFailed {
        error: String,
    },
    ProjectCreate {
        project_id: String,
    },
    ProjectDelete {
        project_id: String,
    },
    CommandStart {
        target_process_id: String,
        command: String,
    },
    GitPullRequest {
        #[serde(rename = "processId")]
        process_id: String,
        project_id: String,
        branch: String,
        message: String,
        patch_id: String,
    },
    SystemStatus {
        status: JsonValue,
    },
    AgentStart {
        agent: JsonValue,
    },
    AgentUpdated {
        agent: JsonValue,
    },
    Error {
        error: String,
    },
    #[serde(other)]
    Unknown,
}

/// Per-cost-update usage payload carried on a `cost_update` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostUsage {
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Downstream (controller → container) message kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownstreamMessage {
    Connect {
        timestamp: i64,
        controller_port: u16,
        core_process_id: String,
    },
    Command {
        command: String,
        args: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<Vec<JsonValue>>,
    },
    SystemCommand {
        command: SystemCommandKind,
    },
    SystemMessage {
        message: String,
    },
    ProjectUpdate {
        project_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed: Option<bool>,
    },
    ProjectReady {
        project_id: String,
        message: String,
    },
    ProjectDeleteComplete {
        project_id: String,
        message: String,
    },
    ProcessEvent {
        process_id: String,
        event: JsonValue,
    },
    EventTypeResponse {
        event_type: String,
        #[serde(flatten)]
        fields: HashMap<String, JsonValue>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemCommandKind {
    Pause,
    Resume,
    Stop,
}

/// Full wire envelope exchanged on a process's duplex connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagiMessage {
    pub process_id: String,
    pub event: UpstreamEvent,
}

impl MagiMessage {
    pub fn new(process_id: impl Into<String>, event: UpstreamEvent) -> Self {
        Self { process_id: process_id.into(), event }
    }
}

/// Per-process cost accumulator. `recent_events` retains only points within the last 60s of the
/// most recent update.
#[derive(Debug, Clone, Default)]
pub struct ProcessCostState {
    pub start_time_ms: i64,
    pub last_update_ms: i64,
    pub total_cost: f64,
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub model_breakdown: HashMap<String, ModelCostBreakdown>,
    pub recent_events: Vec<(i64, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelCostBreakdown {
    pub cost: f64,
    pub calls: usize,
}

const RECENT_WINDOW_MS: i64 = 60_000;

impl ProcessCostState {
    /// Records one cost event at `timestamp_ms`, pruning entries older than 60s relative to it.
    pub fn record(&mut self, model: &str, cost: f64, tokens_in: usize, tokens_out: usize, timestamp_ms: i64) {
        if self.start_time_ms == 0 {
            self.start_time_ms = timestamp_ms;
        }
        self.last_update_ms = timestamp_ms;
        self.total_cost += cost;
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        let entry = self.model_breakdown.entry(model.to_string()).or_default();
        entry.cost += cost;
        entry.calls += 1;

        self.recent_events.push((timestamp_ms, cost));
        self.recent_events.retain(|(ts, _)| timestamp_ms - ts <= RECENT_WINDOW_MS);
    }

    /// Sum of costs within the trailing 60s window as of the last recorded update.
    pub fn cost_last_minute(&self) -> f64 {
        self.recent_events.iter().map(|(_, c)| c).sum()
    }
}

/// Aggregated cost state across all tracked processes, computed on demand.
#[derive(Debug, Clone)]
pub struct GlobalCostSnapshot {
    pub total_cost: f64,
    /// Sum of every tracked process's trailing-60s cost window.
    pub last_min: f64,
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub cost_per_minute: f64,
    pub num_processes: usize,
    pub system_start_time_ms: i64,
    /// Per-model call counts and costs, summed across all tracked processes.
    pub model_breakdown: HashMap<String, ModelCostBreakdown>,
}
