//! Provider-agnostic streaming event taxonomy.
//!
//! [`ClientWrapper`](crate::client_wrapper::ClientWrapper) implementations speak in terms of a
//! single request/response [`Message`](crate::client_wrapper::Message) or, for the lucky few, a
//! [`MessageChunkStream`](crate::client_wrapper::MessageChunkStream) of raw text deltas. The
//! Runner (see [`crate::runner`]) needs a richer, uniform view on top of either: [`StreamingEvent`].
//!
//! [`ProviderStream`] is the adapter that buffers raw chunks (or a single blocking response) into
//! that taxonomy, performing three jobs along the way that every provider would otherwise have to
//! duplicate:
//!
//! 1. **Simulated tool-call parsing** — scanning the aggregated assistant content for a trailing
//!    `TOOL_CALLS: [...]` marker when the provider has no native tool-call channel.
//! 2. **Citation tracking** — deduplicating `(url, title)` annotations by URL, numbering them in
//!    first-seen order, and appending a `References:` footnote.
//! 3. **Usage reporting** — surfacing whatever [`TokenUsage`] the wrapped client captured as a
//!    `cost_update` event.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, ToolDefinition, TokenUsage};

/// Identity of the agent that produced a [`StreamingEvent`], injected by the caller if the
/// provider didn't already attach one.
#[derive(Debug, Clone)]
pub struct AgentExport {
    pub id: String,
    pub name: String,
    pub model: String,
}

/// The uniform event sequence yielded by [`ProviderStream`].
#[derive(Debug, Clone)]
pub enum StreamingEvent {
    AgentStart { agent: AgentExport },
    AgentUpdated { agent: AgentExport },
    MessageDelta {
        agent: AgentExport,
        content: String,
        thinking_content: Option<String>,
        order: u64,
        message_id: String,
    },
    MessageComplete {
        agent: AgentExport,
        content: String,
        message_id: String,
        thinking_content: Option<String>,
    },
    ToolStart { agent: AgentExport, tool_calls: Vec<NativeToolCall> },
    ToolDone { agent: AgentExport, tool_calls: Vec<NativeToolCall>, results: String },
    CostUpdate { agent: AgentExport, usage: TokenUsage },
    Error { agent: AgentExport, error: String },
}

impl StreamingEvent {
    pub fn agent(&self) -> &AgentExport {
        match self {
            StreamingEvent::AgentStart { agent }
            | StreamingEvent::AgentUpdated { agent }
            | StreamingEvent::MessageDelta { agent, .. }
            | StreamingEvent::MessageComplete { agent, .. }
            | StreamingEvent::ToolStart { agent, .. }
            | StreamingEvent::ToolDone { agent, .. }
            | StreamingEvent::CostUpdate { agent, .. }
            | StreamingEvent::Error { agent, .. } => agent,
        }
    }
}

/// A single `(url, title)` citation surfaced by a provider's streaming annotations.
#[derive(Debug, Clone)]
pub struct Citation {
    pub url: String,
    pub title: Option<String>,
}

/// Deduplicates citations by URL and numbers them in first-seen (insertion) order.
///
/// Per the crate's citation-tracking contract: the issuance counter is not the index — it is
/// the position a URL was first inserted into the set that determines its `[n]` number.
#[derive(Default)]
pub struct CitationTracker {
    order: Vec<String>,
    by_url: HashMap<String, Citation>,
}

impl CitationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a citation, returning its 1-based reference number. Existing URLs return their
    /// original number rather than being re-numbered.
    pub fn record(&mut self, citation: Citation) -> usize {
        if let Some(pos) = self.order.iter().position(|u| u == &citation.url) {
            return pos + 1;
        }
        self.order.push(citation.url.clone());
        self.by_url.insert(citation.url.clone(), citation);
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Renders the trailing `References:` footnote block. Numbering matches [`record`]'s return
    /// values exactly, and each URL appears exactly once.
    pub fn footnote(&self) -> String {
        if self.order.is_empty() {
            return String::new();
        }
        let mut out = String::from("\n\nReferences:\n");
        for (i, url) in self.order.iter().enumerate() {
            let citation = &self.by_url[url];
            match &citation.title {
                Some(title) => out.push_str(&format!("[{}] {} - {}\n", i + 1, title, url)),
                None => out.push_str(&format!("[{}] {}\n", i + 1, url)),
            }
        }
        out
    }
}

/// A parsed simulated tool call, prior to being assigned a synthetic `id`.
#[derive(Debug, Clone)]
struct RawSimulatedCall {
    id: Option<String>,
    name: String,
    arguments: JsonValue,
}

/// Scans `content` for a trailing `TOOL_CALLS: [...]` marker (optionally fenced in a
/// ```` ```[lang]\n...\n``` ```` block), using the **last** occurrence if the marker text
/// appears more than once. Returns the remaining prose (marker stripped) and the parsed calls,
/// or `None` if no valid marker is found.
///
/// The placeholder `[Simulated Tool Calls Removed]` is substituted for the stripped marker
/// region when it occurred in the middle of the content; when it was a clean trailing suffix it
/// is simply removed.
pub fn parse_simulated_tool_calls(content: &str) -> Option<(String, Vec<NativeToolCall>)> {
    const MARKER: &str = "TOOL_CALLS:";
    let last_marker_pos = content.rfind(MARKER)?;

    // The payload is whatever follows the marker up to the end of content (possibly inside a
    // fenced code block, in which case a trailing ``` closes it).
    let after_marker = &content[last_marker_pos + MARKER.len()..];
    let bracket_start = after_marker.find('[')?;
    let json_candidate_full = &after_marker[bracket_start..];
    let fence_end = json_candidate_full.find("```");
    let json_candidate = match fence_end {
        Some(idx) => &json_candidate_full[..idx],
        None => json_candidate_full,
    };
    let json_candidate = json_candidate.trim();

    let parsed: JsonValue = serde_json::from_str(json_candidate).ok()?;
    let arr = parsed.as_array()?;
    let mut calls = Vec::new();
    for entry in arr {
        let raw = parse_one_simulated_call(entry)?;
        calls.push(raw);
    }
    if calls.is_empty() {
        return None;
    }

    let native: Vec<NativeToolCall> = calls
        .into_iter()
        .enumerate()
        .map(|(i, c)| NativeToolCall {
            id: c.id.unwrap_or_else(|| format!("simulated_call_{i}")),
            name: c.name,
            arguments: c.arguments,
        })
        .collect();

    // Strip the whole marker region (including any fence open before it) from the visible
    // content. Find the start of the fence (```` ``` ````) preceding the marker, if any.
    let before_marker = &content[..last_marker_pos];
    let fence_open = before_marker.rfind("```");
    let strip_from = fence_open.unwrap_or(last_marker_pos);
    let remaining_before = content[..strip_from].trim_end();
    let remaining_after_start = last_marker_pos + MARKER.len() + bracket_start + json_candidate.len();
    let remaining_after = content
        .get(remaining_after_start..)
        .unwrap_or("")
        .trim_start_matches("```")
        .trim();

    let cleaned = if remaining_after.is_empty() {
        remaining_before.to_string()
    } else {
        format!("{remaining_before}\n[Simulated Tool Calls Removed]\n{remaining_after}")
    };

    Some((cleaned, native))
}

fn parse_one_simulated_call(entry: &JsonValue) -> Option<RawSimulatedCall> {
    let id = entry.get("id").and_then(|v| v.as_str()).map(String::from);
    let (name, arguments) = if let Some(function) = entry.get("function") {
        let name = function.get("name")?.as_str()?.to_string();
        let arguments = function.get("arguments").cloned().unwrap_or(JsonValue::Null);
        (name, arguments)
    } else {
        let name = entry.get("name")?.as_str()?.to_string();
        let arguments = entry.get("arguments").cloned().unwrap_or(JsonValue::Null);
        (name, arguments)
    };
    // arguments may already be a JSON-encoded string, or a raw object; normalize to a string.
    let arguments = match arguments {
        JsonValue::String(s) => JsonValue::String(s),
        other => JsonValue::String(other.to_string()),
    };
    Some(RawSimulatedCall { id, name, arguments })
}

/// Wraps any [`ClientWrapper`] and synthesizes the [`StreamingEvent`] sequence described in the
/// Provider Abstraction contract on top of its blocking `send_message` call. Clients that
/// implement native streaming (`send_message_stream`) are consumed chunk-by-chunk instead and
/// their deltas coalesced into the same event sequence.
pub struct ProviderStream {
    client: Arc<dyn ClientWrapper>,
    agent: AgentExport,
}

impl ProviderStream {
    pub fn new(client: Arc<dyn ClientWrapper>, agent: AgentExport) -> Self {
        Self { client, agent }
    }

    /// Runs one full turn, yielding the ordered [`StreamingEvent`] sequence. Because most
    /// wrapped clients only implement the blocking request/response path, this collects into a
    /// `Vec` rather than a lazy `Stream` — callers that need backpressure should prefer a native
    /// `ClientWrapper::send_message_stream` implementation directly.
    pub async fn run(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Vec<StreamingEvent> {
        let mut events = vec![StreamingEvent::AgentStart { agent: self.agent.clone() }];

        if let Some(mut stream) = match self.client.send_message_stream(messages, tools.clone()).await {
            Ok(s) => s,
            Err(e) => {
                events.push(StreamingEvent::Error { agent: self.agent.clone(), error: e.to_string() });
                return events;
            }
        } {
            use futures_util::StreamExt;
            let message_id = uuid::Uuid::new_v4().to_string();
            let mut order: u64 = 0;
            let mut full = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        if !chunk.content.is_empty() {
                            full.push_str(&chunk.content);
                            events.push(StreamingEvent::MessageDelta {
                                agent: self.agent.clone(),
                                content: chunk.content,
                                thinking_content: None,
                                order,
                                message_id: message_id.clone(),
                            });
                            order += 1;
                        }
                    }
                    Err(e) => {
                        events.push(StreamingEvent::Error { agent: self.agent.clone(), error: e.to_string() });
                        return events;
                    }
                }
            }
            self.finish_message(&mut events, full, message_id);
            return events;
        }

        match self.client.send_message(messages, tools).await {
            Ok(response) => {
                if !response.tool_calls.is_empty() {
                    events.push(StreamingEvent::ToolStart {
                        agent: self.agent.clone(),
                        tool_calls: response.tool_calls.clone(),
                    });
                } else {
                    let message_id = uuid::Uuid::new_v4().to_string();
                    self.finish_message(&mut events, response.content.to_string(), message_id);
                }
                if let Some(usage) = self.client.get_last_usage().await {
                    events.push(StreamingEvent::CostUpdate { agent: self.agent.clone(), usage });
                }
            }
            Err(e) => {
                events.push(StreamingEvent::Error { agent: self.agent.clone(), error: e.to_string() });
            }
        }
        events
    }

    fn finish_message(&self, events: &mut Vec<StreamingEvent>, content: String, message_id: String) {
        if let Some((cleaned, calls)) = parse_simulated_tool_calls(&content) {
            if !cleaned.trim().is_empty() {
                events.push(StreamingEvent::MessageComplete {
                    agent: self.agent.clone(),
                    content: cleaned,
                    message_id: message_id.clone(),
                    thinking_content: None,
                });
            }
            events.push(StreamingEvent::ToolStart { agent: self.agent.clone(), tool_calls: calls });
        } else {
            events.push(StreamingEvent::MessageComplete {
                agent: self.agent.clone(),
                content,
                message_id,
                thinking_content: None,
            });
        }
    }
}
