//! Global cost aggregation and daily-limit enforcement.
//!
//! Grounded on [`crate::cloudllm::cost_tracker::ModelRegistry`]'s plain-struct accounting style;
//! this layer aggregates the per-process [`ProcessCostState`] records the communication hub
//! already tracks rather than computing cost itself.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::controller::storage::StoragePaths;
use crate::controller::wire::{GlobalCostSnapshot, ModelCostBreakdown, ProcessCostState};

/// Aggregates [`ProcessCostState`] across all known processes and enforces the optional daily
/// cost limit loaded from disk.
pub struct CostAggregator {
    processes: RwLock<HashMap<String, ProcessCostState>>,
    system_start_time_ms: i64,
    over_limit: RwLock<bool>,
    last_warning_ms: RwLock<i64>,
}

const WARNING_COOLDOWN_MS: i64 = 60_000;
const WARNING_FRACTION: f64 = 0.8;

impl CostAggregator {
    pub fn new(system_start_time_ms: i64) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            system_start_time_ms,
            over_limit: RwLock::new(false),
            last_warning_ms: RwLock::new(0),
        }
    }

    /// Records a cost event for `process_id`, creating its accumulator lazily.
    pub fn record(&self, process_id: &str, model: &str, cost: f64, tokens_in: usize, tokens_out: usize, timestamp_ms: i64) {
        let mut processes = self.processes.write().unwrap();
        let state = processes.entry(process_id.to_string()).or_default();
        state.record(model, cost, tokens_in, tokens_out, timestamp_ms);
    }

    /// Drops a process's cost state once it is forgotten.
    pub fn forget(&self, process_id: &str) {
        self.processes.write().unwrap().remove(process_id);
    }

    /// Computes the aggregate snapshot across all tracked processes as of `now_ms`.
    pub fn snapshot(&self, now_ms: i64) -> GlobalCostSnapshot {
        let processes = self.processes.read().unwrap();
        let mut total_cost = 0.0;
        let mut last_min = 0.0;
        let mut tokens_in = 0;
        let mut tokens_out = 0;
        let mut model_breakdown: HashMap<String, ModelCostBreakdown> = HashMap::new();
        for state in processes.values() {
            total_cost += state.total_cost;
            last_min += state.cost_last_minute();
            tokens_in += state.tokens_in;
            tokens_out += state.tokens_out;
            for (model, breakdown) in &state.model_breakdown {
                let entry = model_breakdown.entry(model.clone()).or_default();
                entry.cost += breakdown.cost;
                entry.calls += breakdown.calls;
            }
        }

        let elapsed_minutes = (now_ms - self.system_start_time_ms) as f64 / 60_000.0;
        let cost_per_minute = if elapsed_minutes > 1.0 / 60_000.0 { total_cost / elapsed_minutes } else { 0.0 };

        GlobalCostSnapshot {
            total_cost,
            last_min,
            tokens_in,
            tokens_out,
            cost_per_minute,
            num_processes: processes.len(),
            system_start_time_ms: self.system_start_time_ms,
            model_breakdown,
        }
    }

}

/// Result of evaluating the daily cost limit against the current snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitCheckOutcome {
    Skipped,
    OverLimit { message: String },
    Approaching { message: String },
    Cleared,
    NoLimitConfigured,
}

impl CostAggregator {
    /// Evaluates the daily cost limit (loaded fresh from `storage` each call, per the spec's
    /// "loaded on every cost update" contract) against `snapshot.total_cost`.
    pub async fn evaluate_daily_limit(
        &self,
        storage: &StoragePaths,
        snapshot: &GlobalCostSnapshot,
        now_ms: i64,
    ) -> Result<LimitCheckOutcome, crate::controller::error::ControllerError> {
        let daily_limit = match storage.load_daily_cost_limit().await? {
            Some(limit) => limit,
            None => return Ok(LimitCheckOutcome::NoLimitConfigured),
        };

        let was_over = *self.over_limit.read().unwrap();
        if snapshot.total_cost > daily_limit {
            if !was_over {
                *self.over_limit.write().unwrap() = true;
                log::error!("daily cost limit exceeded: {:.4} > {:.4}", snapshot.total_cost, daily_limit);
                return Ok(LimitCheckOutcome::OverLimit {
                    message: format!("Daily cost limit of ${daily_limit:.2} exceeded (current: ${:.2})", snapshot.total_cost),
                });
            }
            return Ok(LimitCheckOutcome::Skipped);
        }

        if was_over {
            *self.over_limit.write().unwrap() = false;
            return Ok(LimitCheckOutcome::Cleared);
        }

        if snapshot.total_cost > WARNING_FRACTION * daily_limit {
            let mut last_warning = self.last_warning_ms.write().unwrap();
            if now_ms - *last_warning >= WARNING_COOLDOWN_MS {
                *last_warning = now_ms;
                return Ok(LimitCheckOutcome::Approaching {
                    message: format!(
                        "Approaching daily cost limit of ${daily_limit:.2} (current: ${:.2})",
                        snapshot.total_cost
                    ),
                });
            }
        }

        Ok(LimitCheckOutcome::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(total_cost: f64) -> GlobalCostSnapshot {
        GlobalCostSnapshot {
            total_cost,
            last_min: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            cost_per_minute: 0.0,
            num_processes: 1,
            system_start_time_ms: 0,
            model_breakdown: HashMap::new(),
        }
    }

    #[test]
    fn snapshot_sums_last_min_and_model_breakdown_across_processes() {
        let agg = CostAggregator::new(0);
        agg.record("p1", "claude-opus", 1.0, 100, 200, 1_000);
        agg.record("p2", "claude-opus", 2.0, 50, 75, 1_000);
        agg.record("p2", "claude-haiku", 0.5, 10, 20, 1_000);

        let snap = agg.snapshot(2_000);

        assert_eq!(snap.total_cost, 3.5);
        assert_eq!(snap.last_min, 3.5);
        assert_eq!(snap.tokens_in, 160);
        assert_eq!(snap.tokens_out, 295);
        assert_eq!(snap.num_processes, 2);
        assert_eq!(snap.model_breakdown.get("claude-opus").unwrap().calls, 2);
        assert_eq!(snap.model_breakdown.get("claude-opus").unwrap().cost, 3.0);
        assert_eq!(snap.model_breakdown.get("claude-haiku").unwrap().calls, 1);
    }

    #[tokio::test]
    async fn no_limit_file_skips_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StoragePaths {
            task_messages_dir: dir.path().to_path_buf(),
            daily_cost_limit_path: dir.path().join("dailyCostLimit.json"),
            projects_dir: dir.path().join("projects"),
        };
        let agg = CostAggregator::new(0);
        let outcome = agg.evaluate_daily_limit(&storage, &snapshot(1000.0), 1000).await.unwrap();
        assert_eq!(outcome, LimitCheckOutcome::NoLimitConfigured);
    }

    #[tokio::test]
    async fn over_limit_flags_once_then_suppresses() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StoragePaths {
            task_messages_dir: dir.path().to_path_buf(),
            daily_cost_limit_path: dir.path().join("dailyCostLimit.json"),
            projects_dir: dir.path().join("projects"),
        };
        tokio::fs::write(&storage.daily_cost_limit_path, r#"{"dailyLimit": 10.0}"#).await.unwrap();
        let agg = CostAggregator::new(0);

        let first = agg.evaluate_daily_limit(&storage, &snapshot(11.0), 1000).await.unwrap();
        assert!(matches!(first, LimitCheckOutcome::OverLimit { .. }));

        let second = agg.evaluate_daily_limit(&storage, &snapshot(12.0), 2000).await.unwrap();
        assert_eq!(second, LimitCheckOutcome::Skipped);
    }

    #[tokio::test]
    async fn dropping_back_under_limit_clears_flag() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StoragePaths {
            task_messages_dir: dir.path().to_path_buf(),
            daily_cost_limit_path: dir.path().join("dailyCostLimit.json"),
            projects_dir: dir.path().join("projects"),
        };
        tokio::fs::write(&storage.daily_cost_limit_path, r#"{"dailyLimit": 10.0}"#).await.unwrap();
        let agg = CostAggregator::new(0);
        agg.evaluate_daily_limit(&storage, &snapshot(11.0), 1000).await.unwrap();
        let cleared = agg.evaluate_daily_limit(&storage, &snapshot(5.0), 2000).await.unwrap();
        assert_eq!(cleared, LimitCheckOutcome::Cleared);
    }

    #[tokio::test]
    async fn approaching_limit_warns_with_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StoragePaths {
            task_messages_dir: dir.path().to_path_buf(),
            daily_cost_limit_path: dir.path().join("dailyCostLimit.json"),
            projects_dir: dir.path().join("projects"),
        };
        tokio::fs::write(&storage.daily_cost_limit_path, r#"{"dailyLimit": 10.0}"#).await.unwrap();
        let agg = CostAggregator::new(0);
        let first = agg.evaluate_daily_limit(&storage, &snapshot(9.0), 1000).await.unwrap();
        assert!(matches!(first, LimitCheckOutcome::Approaching { .. }));
        let second = agg.evaluate_daily_limit(&storage, &snapshot(9.0), 1500).await.unwrap();
        assert_eq!(second, LimitCheckOutcome::Skipped);
    }
}
