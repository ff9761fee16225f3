//! Staged orchestrator: executes a directed graph of named stages, each driven by a
//! [`Runner`](crate::cloudllm::runner::Runner) turn, with per-stage retry budgets and
//! `STATUS:`/`NEXT:`/`METADATA:` marker parsing to decide what happens next.
//!
//! Generalizes the teacher's RALPH loop (`[TASK_COMPLETE:id]` marker scanning over a fixed
//! PRD checklist, in `orchestration.rs`) into an open-ended stage graph: instead of looping
//! the same prompt against a flat task list, each stage's agent decides the next stage (or
//! requests a retry, or fails) via markers in its final response text.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::cloudllm::llm_session::ConversationItem;
use crate::cloudllm::runner::{Runner, RunnerAgent, RunnerError, RunnerHandlers};

/// Terminal or continuing status an agent's final response communicates for its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    NeedsRetry,
    Failure,
}

/// Everything recorded about one stage execution, keyed by stage name in
/// [`StagedRunResult::results`].
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub response: String,
    pub next: Option<String>,
    pub metadata: Option<JsonValue>,
}

/// Shapes the conversation history handed to a stage's agent, given the history accumulated so
/// far and the outcomes of every stage run before it. Returning `history` unchanged is the
/// default behavior when a stage defines no shaper.
pub type InputShaper =
    Arc<dyn Fn(&[ConversationItem], &HashMap<String, StageOutcome>) -> Vec<ConversationItem> + Send + Sync>;

/// Picks the next stage to run when the agent's response carries no explicit `NEXT:` marker.
/// Returns `None` to terminate the sequence.
pub type NextFn = Arc<dyn Fn(&str, &HashMap<String, StageOutcome>) -> Option<String> + Send + Sync>;

/// Produces the [`RunnerAgent`] that should drive one execution of a stage, given the metadata
/// the previous stage handed off (if any).
pub type AgentFactory = Arc<dyn Fn(Option<&JsonValue>) -> Arc<dyn RunnerAgent> + Send + Sync>;

/// Either a statically configured next stage, or a closure computing one from the stage's
/// output and the results gathered so far.
pub enum NextSelector {
    Fixed(Option<String>),
    Computed(NextFn),
}

impl NextSelector {
    fn resolve(&self, output: &str, results: &HashMap<String, StageOutcome>) -> Option<String> {
        match self {
            NextSelector::Fixed(next) => next.clone(),
            NextSelector::Computed(f) => f(output, results),
        }
    }
}

/// One node in the stage graph.
pub struct StageConfig {
    pub agent_factory: AgentFactory,
    pub input: Option<InputShaper>,
    pub next: NextSelector,
}

impl StageConfig {
    pub fn new(agent_factory: AgentFactory, next: NextSelector) -> Self {
        Self { agent_factory, input: None, next }
    }

    pub fn with_input_shaper(mut self, shaper: InputShaper) -> Self {
        self.input = Some(shaper);
        self
    }
}

/// Outcome of [`StagedOrchestrator::run_sequential`].
#[derive(Debug, Clone)]
pub struct StagedRunResult {
    pub results: HashMap<String, StageOutcome>,
    pub order: Vec<String>,
    pub terminal_status: StageStatus,
    pub total_retries: usize,
}

/// Drives a static graph of named stages to completion, enforcing per-stage and global retry
/// budgets and parsing each stage's `STATUS:`/`NEXT:`/`METADATA:` markers.
pub struct StagedOrchestrator {
    stages: HashMap<String, StageConfig>,
    runner: Arc<Runner>,
    max_retries_per_stage: usize,
    max_total_retries: usize,
}

impl StagedOrchestrator {
    pub fn new(runner: Arc<Runner>, max_retries_per_stage: usize, max_total_retries: usize) -> Self {
        Self { stages: HashMap::new(), runner, max_retries_per_stage, max_total_retries }
    }

    pub fn add_stage(&mut self, name: impl Into<String>, config: StageConfig) {
        self.stages.insert(name.into(), config);
    }

    /// Runs the graph starting at `start_stage` with `initial_input` as the first user message.
    pub async fn run_sequential(
        &self,
        start_stage: &str,
        initial_input: &str,
    ) -> Result<StagedRunResult, RunnerError> {
        let mut results: HashMap<String, StageOutcome> = HashMap::new();
        let mut order = Vec::new();
        let mut stage_retries: HashMap<String, usize> = HashMap::new();
        let mut total_retries = 0usize;
        let mut history: Vec<ConversationItem> = Vec::new();
        let mut metadata: Option<JsonValue> = None;

        let mut current = start_stage.to_string();
        let mut next_input = initial_input.to_string();

        loop {
            let stage = self
                .stages
                .get(&current)
                .ok_or_else(|| RunnerError::InvalidStageGraph { stage: current.clone() })?;

            let retries = stage_retries.entry(current.clone()).or_insert(0);
            if *retries >= self.max_retries_per_stage {
                log::error!("stage '{current}' exhausted its retry budget ({})", self.max_retries_per_stage);
                results.insert(
                    current.clone(),
                    StageOutcome { status: StageStatus::Failure, response: String::new(), next: None, metadata: None },
                );
                order.push(current.clone());
                return Ok(StagedRunResult { results, order, terminal_status: StageStatus::Failure, total_retries });
            }

            let stage_history = match &stage.input {
                Some(shaper) => shaper(&history, &results),
                None => history.clone(),
            };
            let mut turn_history = stage_history;

            let agent = (stage.agent_factory)(metadata.as_ref());
            let handlers = RunnerHandlers::default();

            log::info!("running stage '{current}' (attempt {})", *retries + 1);
            let response = self
                .runner
                .run_streamed_with_tools(agent.as_ref(), &next_input, &mut turn_history, &handlers)
                .await?;
            history = turn_history;

            let status = parse_status(&response);
            match status {
                Some(StageStatus::NeedsRetry) => {
                    *retries += 1;
                    total_retries += 1;
                    log::info!("stage '{current}' requested a retry ({}/{})", *retries, self.max_retries_per_stage);
                    if total_retries >= self.max_total_retries {
                        log::error!("global retry budget exceeded at stage '{current}'");
                        results.insert(
                            current.clone(),
                            StageOutcome { status: StageStatus::Failure, response, next: None, metadata: None },
                        );
                        order.push(current.clone());
                        return Ok(StagedRunResult {
                            results,
                            order,
                            terminal_status: StageStatus::Failure,
                            total_retries,
                        });
                    }
                    next_input = String::new();
                    continue;
                }
                Some(StageStatus::Failure) => {
                    log::error!("stage '{current}' reported FAILURE");
                    results.insert(
                        current.clone(),
                        StageOutcome { status: StageStatus::Failure, response, next: None, metadata: None },
                    );
                    order.push(current.clone());
                    return Ok(StagedRunResult {
                        results,
                        order,
                        terminal_status: StageStatus::Failure,
                        total_retries,
                    });
                }
                _ => {}
            }

            let parsed_next = parse_next(&response);
            let parsed_metadata = parse_metadata(&response);
            if parsed_next.is_some() && !self.stages.contains_key(parsed_next.as_ref().unwrap()) {
                let bad = parsed_next.unwrap();
                log::error!("stage '{current}' named unknown next stage '{bad}'");
                return Err(RunnerError::InvalidStageGraph { stage: bad });
            }

            let next_stage = match &parsed_next {
                Some(n) => Some(n.clone()),
                None => stage.next.resolve(&response, &results),
            };

            let outcome = StageOutcome {
                status: StageStatus::Completed,
                response: response.clone(),
                next: next_stage.clone(),
                metadata: parsed_metadata.clone(),
            };
            results.insert(current.clone(), outcome);
            order.push(current.clone());

            match next_stage {
                Some(next) if self.stages.contains_key(&next) => {
                    metadata = parsed_metadata;
                    next_input = String::new();
                    current = next;
                }
                Some(next) => {
                    log::error!("stage '{current}' selected unknown next stage '{next}'");
                    return Err(RunnerError::InvalidStageGraph { stage: next });
                }
                None => {
                    log::info!("stage sequence terminated after '{current}'");
                    return Ok(StagedRunResult {
                        results,
                        order,
                        terminal_status: StageStatus::Completed,
                        total_retries,
                    });
                }
            }
        }
    }
}

/// Scans `text` for a `STATUS: <WORD>` marker. Returns `None` when absent (treated as an
/// implicit completion, matching the RALPH loop's original tolerance for agents that complete
/// tasks without emitting an explicit status line).
fn parse_status(text: &str) -> Option<StageStatus> {
    let marker = find_last(text, "STATUS:")?;
    let rest = text[marker + "STATUS:".len()..].trim_start();
    let word: String = rest.chars().take_while(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    match word.as_str() {
        "NEEDS_RETRY" => Some(StageStatus::NeedsRetry),
        "FAILURE" => Some(StageStatus::Failure),
        "COMPLETED" | "SUCCESS" => Some(StageStatus::Completed),
        _ => None,
    }
}

/// Scans `text` for a `NEXT: <stage>` marker, taking the rest of the line as the stage name.
/// A literal `null` terminates the sequence and is returned as `None`.
fn parse_next(text: &str) -> Option<String> {
    let marker = find_last(text, "NEXT:")?;
    let rest = text[marker + "NEXT:".len()..].trim_start();
    let line_end = rest.find('\n').unwrap_or(rest.len());
    let name = rest[..line_end].trim();
    if name.is_empty() || name.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(name.to_string())
    }
}

/// Scans `text` for a `METADATA: <json>` marker and parses the remainder of the line as JSON.
/// Parse errors are logged and treated as absent metadata, matching the teacher's tolerance for
/// malformed marker payloads.
fn parse_metadata(text: &str) -> Option<JsonValue> {
    let marker = find_last(text, "METADATA:")?;
    let rest = text[marker + "METADATA:".len()..].trim_start();
    let line_end = rest.find('\n').unwrap_or(rest.len());
    let candidate = rest[..line_end].trim();
    match serde_json::from_str::<JsonValue>(candidate) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("failed to parse METADATA marker payload '{candidate}': {e}");
            None
        }
    }
}

fn find_last(text: &str, marker: &str) -> Option<usize> {
    text.rfind(marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_recognizes_needs_retry() {
        assert_eq!(parse_status("work in progress\nSTATUS: NEEDS_RETRY"), Some(StageStatus::NeedsRetry));
    }

    #[test]
    fn parse_status_returns_none_when_absent() {
        assert_eq!(parse_status("just some prose"), None);
    }

    #[test]
    fn parse_next_extracts_stage_name() {
        assert_eq!(parse_next("done\nNEXT: review\nMETADATA: {}"), Some("review".to_string()));
    }

    #[test]
    fn parse_next_treats_literal_null_as_termination() {
        assert_eq!(parse_next("done\nNEXT: null"), None);
    }

    #[test]
    fn parse_metadata_parses_trailing_json() {
        let meta = parse_metadata("NEXT: b\nMETADATA: {\"k\":1}").unwrap();
        assert_eq!(meta["k"], 1);
    }

    #[test]
    fn parse_metadata_is_none_on_malformed_json() {
        assert!(parse_metadata("METADATA: not json").is_none());
    }

    #[test]
    fn last_marker_occurrence_wins() {
        let text = "earlier NEXT: a later NEXT: b";
        assert_eq!(parse_next(text), Some("b".to_string()));
    }
}
