// src/lib.rs

// Import the top-level `cloudllm` and `controller` modules.
pub mod cloudllm;
pub mod controller;

// If you want to provide direct access (without having to navigate through the whole hierarchy) to certain types or functionalities at the crate level, you can use re-exports:

// Re-exporting key items for easier external access.
pub use cloudllm::agent::Agent;
pub use cloudllm::client_wrapper::{ClientWrapper, Message, Role};
pub use cloudllm::llm_session::LLMSession;
pub use cloudllm::runner::{Runner, RunnerAgent, RunnerError};
pub use controller::{CommunicationHub, ControllerConfig, ControllerError, CostAggregator, EventRouter, ProcessManager};

// Re-export every `cloudllm::` submodule directly at the crate root too, so callers can write
// `cloudllm::tool_protocol::X` instead of having to go through the `cloudllm::cloudllm::` stutter
// that coexisting the crate name and its top-level module would otherwise force.
pub use cloudllm::{
    agent, client_wrapper, clients, config, context_strategy, cost_tracker, event, llm_session,
    resource_protocol, runner, staged_orchestrator, streaming, tdd_orchestrator, thought_chain,
    tool_adapters, tool_catalog, tool_protocol, tool_protocols, tools,
};

/// Convenience logger initializer for binaries, examples, and tests.
///
/// The library itself never calls this or any other `env_logger` init function; only the
/// consuming binary decides when and how logging starts. Safe to call more than once in the same
/// process (e.g. from many `#[test]` functions in one test binary).
pub fn init_logger() {
    let _ = env_logger::try_init();
}
