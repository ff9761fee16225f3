//! Agent-scoped tool materialization and dispatch on top of [`ToolRegistry`].
//!
//! [`ToolRegistry`] already knows how to register, look up, and execute tools against a
//! [`ToolProtocol`](crate::tool_protocol::ToolProtocol) backend. [`DynamicToolCatalog`] wraps it
//! with two things the Runner (see [`crate::runner`]) needs that the registry alone doesn't
//! provide: an agent-id-specific tool overlay (so one agent can see tools another can't), and
//! resolution of dynamic parameter `description`/`enum` callables before a tool list is handed
//! to a provider.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::cloudllm::client_wrapper::NativeToolCall;
use crate::cloudllm::tool_protocol::{ToolError, ToolMetadata, ToolRegistry, ToolResult};

/// A callable that resolves a parameter's `description` or `enum` list at materialization time,
/// given the agent id the tool list is being built for. Boxed so catalogs can hold a
/// heterogeneous set of dynamic resolvers.
pub type DescriptionResolver = Arc<dyn Fn(&str) -> String + Send + Sync>;
pub type EnumResolver = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Registered dynamic resolvers for a single parameter path within a tool (e.g. `"query"` or,
/// for nested object/array schemas, `"filters.status"` / `"tags[]"`).
#[derive(Default, Clone)]
pub struct DynamicParameterHooks {
    description: Option<DescriptionResolver>,
    enum_values: Option<EnumResolver>,
}

/// Lifecycle hook invoked before a tool call is dispatched.
pub type OnToolCall = Arc<dyn Fn(&NativeToolCall) + Send + Sync>;
/// Lifecycle hook invoked after a tool call completes, with the serialized result string.
pub type OnToolResult = Arc<dyn Fn(&NativeToolCall, &str) + Send + Sync>;

/// Wraps a [`ToolRegistry`] with an agent-id-specific overlay and dynamic schema resolution.
pub struct DynamicToolCatalog {
    registry: ToolRegistry,
    /// Tools visible only to a specific agent id, layered on top of the static tool list.
    agent_overlay: RwLock<HashMap<String, Vec<String>>>,
    /// Dynamic parameter hooks keyed by `(tool_name, parameter_path)`.
    dynamic_hooks: RwLock<HashMap<(String, String), DynamicParameterHooks>>,
    on_tool_call: Option<OnToolCall>,
    on_tool_result: Option<OnToolResult>,
}

impl DynamicToolCatalog {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            agent_overlay: RwLock::new(HashMap::new()),
            dynamic_hooks: RwLock::new(HashMap::new()),
            on_tool_call: None,
            on_tool_result: None,
        }
    }

    pub fn with_hooks(mut self, on_tool_call: OnToolCall, on_tool_result: OnToolResult) -> Self {
        self.on_tool_call = Some(on_tool_call);
        self.on_tool_result = Some(on_tool_result);
        self
    }

    /// Grants `agent_id` visibility into additional tool names beyond the static list.
    pub async fn overlay_tools_for_agent(&self, agent_id: &str, tool_names: Vec<String>) {
        self.agent_overlay.write().await.insert(agent_id.to_string(), tool_names);
    }

    /// Registers a dynamic `description` resolver for `tool_name`'s parameter at `param_path`
    /// (dot-separated for nested object properties, e.g. `"filters.status"`).
    pub async fn register_description_resolver(
        &self,
        tool_name: &str,
        param_path: &str,
        resolver: DescriptionResolver,
    ) {
        let mut hooks = self.dynamic_hooks.write().await;
        hooks.entry((tool_name.to_string(), param_path.to_string())).or_default().description = Some(resolver);
    }

    /// Registers a dynamic `enum` resolver for `tool_name`'s parameter at `param_path`.
    pub async fn register_enum_resolver(&self, tool_name: &str, param_path: &str, resolver: EnumResolver) {
        let mut hooks = self.dynamic_hooks.write().await;
        hooks.entry((tool_name.to_string(), param_path.to_string())).or_default().enum_values = Some(resolver);
    }

    /// Materializes the canonical tool list visible to `agent_id`: the static registry tools,
    /// overlaid with any agent-id-specific tools, with all dynamic description/enum resolvers
    /// applied (including nested object properties and array item schemas).
    pub async fn materialize_for_agent(&self, agent_id: &str) -> Vec<ToolMetadata> {
        let mut seen = HashMap::new();
        for metadata in self.registry.list_tools() {
            seen.insert(metadata.name.clone(), metadata.clone());
        }

        if let Some(overlay_names) = self.agent_overlay.read().await.get(agent_id) {
            for name in overlay_names {
                if let Some(tool) = self.registry.get_tool(name) {
                    seen.insert(name.clone(), tool.metadata().clone());
                }
            }
        }

        let hooks = self.dynamic_hooks.read().await;
        let mut result: Vec<ToolMetadata> = seen.into_values().collect();
        for metadata in result.iter_mut() {
            Self::resolve_dynamic_parameters(&metadata.name.clone(), &mut metadata.parameters, "", agent_id, &hooks);
        }
        result
    }

    fn resolve_dynamic_parameters(
        tool_name: &str,
        parameters: &mut [crate::cloudllm::tool_protocol::ToolParameter],
        prefix: &str,
        agent_id: &str,
        hooks: &HashMap<(String, String), DynamicParameterHooks>,
    ) {
        for param in parameters.iter_mut() {
            let path = if prefix.is_empty() { param.name.clone() } else { format!("{prefix}.{}", param.name) };
            if let Some(hook) = hooks.get(&(tool_name.to_string(), path.clone())) {
                if let Some(resolver) = &hook.description {
                    param.description = Some(resolver(agent_id));
                }
                if let Some(resolver) = &hook.enum_values {
                    let values = resolver(agent_id);
                    param.default = param.default.take().or_else(|| {
                        if values.is_empty() { None } else { Some(serde_json::json!(values)) }
                    });
                }
            }
            if let Some(properties) = param.properties.as_mut() {
                let mut nested: Vec<_> = properties.values_mut().collect();
                for p in nested.iter_mut() {
                    let nested_path = format!("{path}.{}", p.name);
                    if let Some(hook) = hooks.get(&(tool_name.to_string(), nested_path.clone())) {
                        if let Some(resolver) = &hook.description {
                            p.description = Some(resolver(agent_id));
                        }
                    }
                }
            }
        }
    }

    /// Dispatches one tool call: decodes `arguments` (empty string ⇒ `{}`; invalid JSON ⇒ a
    /// structured error echoing the raw string), invokes the tool, runs lifecycle hooks, and
    /// returns the serialized result string.
    pub async fn dispatch(&self, call: &NativeToolCall) -> String {
        if let Some(hook) = &self.on_tool_call {
            hook(call);
        }

        let params = match &call.arguments {
            JsonValue::String(s) if s.is_empty() => JsonValue::Object(Default::default()),
            JsonValue::String(s) => match serde_json::from_str::<JsonValue>(s) {
                Ok(v) => v,
                Err(_) => {
                    let err = format!("invalid JSON arguments for tool '{}': {}", call.name, s);
                    if let Some(hook) = &self.on_tool_result {
                        hook(call, &err);
                    }
                    return err;
                }
            },
            other => other.clone(),
        };

        let result = self.registry.execute_tool(&call.name, params).await;
        let serialized = Self::serialize_result(&call.name, result);

        if let Some(hook) = &self.on_tool_result {
            hook(call, &serialized);
        }
        serialized
    }

    /// Dispatches a batch of tool calls and normalizes the result per the crate's `tool_done`
    /// contract: a single call yields its result JSON-stringified directly, multiple calls yield
    /// a JSON array of `{tool, input, output}` / `{tool, input, error}` entries.
    pub async fn dispatch_batch(&self, calls: &[NativeToolCall]) -> String {
        if calls.len() == 1 {
            return self.dispatch(&calls[0]).await;
        }

        let mut entries = Vec::with_capacity(calls.len());
        for call in calls {
            let raw = self.dispatch(call).await;
            let entry = match serde_json::from_str::<JsonValue>(&raw) {
                Ok(parsed) if parsed.get("__tool_error").is_some() => serde_json::json!({
                    "tool": call.name,
                    "input": call.arguments,
                    "error": parsed["__tool_error"],
                }),
                Ok(parsed) => serde_json::json!({ "tool": call.name, "input": call.arguments, "output": parsed }),
                Err(_) => serde_json::json!({ "tool": call.name, "input": call.arguments, "output": raw }),
            };
            entries.push(entry);
        }
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }

    fn serialize_result(
        tool_name: &str,
        result: Result<ToolResult, Box<dyn Error + Send + Sync>>,
    ) -> String {
        match result {
            Ok(tool_result) if tool_result.success => tool_result
                .output
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| tool_result.output.to_string()),
            Ok(tool_result) => {
                let msg = tool_result.error.unwrap_or_else(|| "tool execution failed".to_string());
                serde_json::json!({ "__tool_error": msg }).to_string()
            }
            Err(e) => {
                let msg = match e.downcast_ref::<ToolError>() {
                    Some(ToolError::NotFound(name)) => format!("tool not found: {name}"),
                    _ => format!("dispatch error for '{tool_name}': {e}"),
                };
                serde_json::json!({ "__tool_error": msg }).to_string()
            }
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }
}
