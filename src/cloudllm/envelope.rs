//! Event envelope — the single structured record carried on every topic.
//!
//! Every node in the runtime consumes and produces [`EventEnvelope`]s. The envelope carries the
//! conversation's full state so that no node needs to keep conversation-scoped memory of its own:
//! restart a node, and the next envelope the broker redelivers carries everything needed to
//! resume correctly.
//!
//! # Example
//!
//! ```rust
//! use cloudllm::envelope::{EventEnvelope, EnvelopeKind, LatestMessage};
//! use cloudllm::client_wrapper::{Message, Role};
//! use std::sync::Arc;
//!
//! let envelope = EventEnvelope::new_user_prompt(
//!     "trace-1",
//!     Message { role: Role::User, content: Arc::from("hello"), tool_calls: vec![] },
//! );
//! assert_eq!(envelope.kind, EnvelopeKind::UserPrompt);
//! assert!(envelope.delegation_stack.is_empty());
//! ```

use crate::cloudllm::client_wrapper::Message;
use crate::cloudllm::groupchat::GroupchatData;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Tagged variant describing what an envelope represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    UserPrompt,
    AiResponse,
    ToolCallRequest,
    ToolResult,
    EndOfTurn,
}

/// One tool call requested by a model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: JsonValue,
}

/// A tool's answer to a previously issued [`ToolCallPart`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReturnPart {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

/// The most recent message on an envelope, polymorphic over the three shapes a message can take.
///
/// Kept alongside `message_history` as a deliberate optimization so downstream nodes don't have to
/// re-scan the tail of the history to find out what just happened; `message_history` remains the
/// authoritative source of truth and `latest_message` is validated against its tail on ingest (see
/// [`EventEnvelope::push_latest_into_history`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum LatestMessage {
    UserInput(Message),
    ModelResponse {
        message: Message,
        tool_calls: Vec<ToolCallPart>,
    },
    /// One tool call dispatched to a single tool node, split out of a `ModelResponse`'s
    /// `tool_calls` list by the agent router. This is what a [`ToolNode`](crate::cloudllm::nodes::tool_node::ToolNode)
    /// actually receives on `tool.in.{tool_name}` — never the full multi-call `ModelResponse`.
    ToolCall(ToolCallPart),
    ToolReturn(ToolReturnPart),
}

impl LatestMessage {
    /// Best-effort plain text view, used for the group-chat skip check and for synthesizing
    /// delegation tool-returns from a sub-agent's final text.
    pub fn text(&self) -> &str {
        match self {
            LatestMessage::UserInput(m) => m.content.as_ref(),
            LatestMessage::ModelResponse { message, .. } => message.content.as_ref(),
            LatestMessage::ToolCall(part) => part.tool_name.as_str(),
            LatestMessage::ToolReturn(t) => t.content.as_str(),
        }
    }

    pub fn tool_calls(&self) -> &[ToolCallPart] {
        match self {
            LatestMessage::ModelResponse { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// The single dispatched call this envelope carries, if it is a [`LatestMessage::ToolCall`].
    pub fn as_tool_call(&self) -> Option<&ToolCallPart> {
        match self {
            LatestMessage::ToolCall(part) => Some(part),
            _ => None,
        }
    }

    fn as_message(&self) -> Message {
        use crate::cloudllm::client_wrapper::Role;
        match self {
            LatestMessage::UserInput(m) => m.clone(),
            LatestMessage::ModelResponse { message, .. } => message.clone(),
            LatestMessage::ToolCall(part) => Message {
                role: Role::Assistant,
                content: std::sync::Arc::from(
                    format!("(dispatched tool call: {})", part.tool_name).as_str(),
                ),
                tool_calls: vec![],
            },
            LatestMessage::ToolReturn(t) => Message {
                role: Role::Tool {
                    call_id: t.tool_call_id.clone(),
                },
                content: std::sync::Arc::from(t.content.as_str()),
                tool_calls: vec![],
            },
        }
    }
}

/// One frame on the delegation stack, representing one delegation hop.
///
/// Pushed onto [`EventEnvelope::delegation_stack`] when an [`AgentRouterNode`](crate::cloudllm::nodes::agent_router_node::AgentRouterNode)
/// delegates to a sub-agent, and popped when the sub-agent's response returns on the caller's
/// returnpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationFrame {
    /// Return address — the topic where the synthesized tool-return must be published.
    pub caller_private_topic: String,
    /// The caller's original `final_response_topic`, restored on return.
    pub caller_final_response_topic: Option<String>,
    /// ID of the tool call that triggered the delegation.
    pub tool_call_id: String,
    /// Name of the (delegation) tool that triggered the delegation.
    pub tool_name: String,
    /// The caller's `response_id` at the moment of delegation, restored onto the synthesized
    /// tool-return on the way back so the caller's join buffer (keyed on `(trace_id,
    /// response_id)`) recognizes it — the callee's own chat node mints unrelated `response_id`s
    /// for its own turns in between.
    pub caller_response_id: Option<String>,
}

/// The structured record passed on every topic.
///
/// See the crate-level design notes for the full invariant list; the two enforced directly by
/// this type are: `trace_id` is never empty (checked in [`EventEnvelope::new`]), and
/// `latest_message` is kept in step with the tail of `message_history` by
/// [`EventEnvelope::push_latest_into_history`], which is the only method that appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub kind: EnvelopeKind,
    pub trace_id: String,
    pub message_history: Vec<Message>,
    pub latest_message: Option<LatestMessage>,
    pub final_response_topic: Option<String>,
    pub delegation_stack: Vec<DelegationFrame>,
    pub groupchat_data: Option<GroupchatData>,
    pub patch_model_settings: Option<JsonValue>,
    pub patch_model_request_params: Option<JsonValue>,
    /// Identifier minted by the chat node for one model response; used by the router's join
    /// buffer to key fan-in of parallel tool calls.
    pub response_id: Option<String>,
    /// Fields this build doesn't recognize, preserved so a rolling upgrade doesn't drop data a
    /// newer node attached.
    #[serde(default, flatten)]
    pub unknown_fields: HashMap<String, JsonValue>,
}

impl EventEnvelope {
    /// Create a bare envelope. `trace_id` must be non-empty — callers almost always want
    /// [`EventEnvelope::new_user_prompt`] instead.
    pub fn new(kind: EnvelopeKind, trace_id: impl Into<String>) -> Self {
        let trace_id = trace_id.into();
        debug_assert!(!trace_id.is_empty(), "trace_id must not be empty");
        Self {
            kind,
            trace_id,
            message_history: Vec::new(),
            latest_message: None,
            final_response_topic: None,
            delegation_stack: Vec::new(),
            groupchat_data: None,
            patch_model_settings: None,
            patch_model_request_params: None,
            response_id: None,
            unknown_fields: HashMap::new(),
        }
    }

    /// Start a new trace with the given user message.
    pub fn new_user_prompt(trace_id: impl Into<String>, message: Message) -> Self {
        let mut envelope = Self::new(EnvelopeKind::UserPrompt, trace_id);
        envelope.latest_message = Some(LatestMessage::UserInput(message));
        envelope
    }

    /// Append `latest_message` to `message_history`, re-deriving it as authoritative.
    ///
    /// This is the only method that mutates `message_history`; per the router's "history
    /// authority" invariant, only the agent router node calls it.
    pub fn push_latest_into_history(&mut self) {
        if let Some(latest) = &self.latest_message {
            self.message_history.push(latest.as_message());
        }
    }

    /// `true` once `message_history` ends with a message equal in role/content to
    /// `latest_message` — the invariant checked by the router's own tests.
    pub fn latest_matches_history_tail(&self) -> bool {
        match (&self.latest_message, self.message_history.last()) {
            (None, None) => true,
            (Some(latest), Some(tail)) => {
                let derived = latest.as_message();
                std::mem::discriminant(&derived.role) == std::mem::discriminant(&tail.role)
                    && derived.content == tail.content
            }
            _ => false,
        }
    }

    pub fn push_delegation_frame(&mut self, frame: DelegationFrame) {
        self.delegation_stack.push(frame);
    }

    pub fn pop_delegation_frame(&mut self) -> Option<DelegationFrame> {
        self.delegation_stack.pop()
    }

    /// Shallow clone of everything except `kind`/`latest_message`, used by nodes that respond
    /// with a new envelope copying the rest of the conversation state forward.
    pub fn derive(&self, kind: EnvelopeKind, latest_message: Option<LatestMessage>) -> Self {
        Self {
            kind,
            trace_id: self.trace_id.clone(),
            message_history: self.message_history.clone(),
            latest_message,
            final_response_topic: self.final_response_topic.clone(),
            delegation_stack: self.delegation_stack.clone(),
            groupchat_data: self.groupchat_data.clone(),
            patch_model_settings: self.patch_model_settings.clone(),
            patch_model_request_params: self.patch_model_request_params.clone(),
            response_id: self.response_id.clone(),
            unknown_fields: self.unknown_fields.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::Role;
    use std::sync::Arc;

    #[test]
    fn new_user_prompt_has_no_history_yet() {
        let envelope = EventEnvelope::new_user_prompt(
            "t1",
            Message {
                role: Role::User,
                content: Arc::from("hi"),
                tool_calls: vec![],
            },
        );
        assert!(envelope.message_history.is_empty());
        assert!(envelope.latest_matches_history_tail() == false);
    }

    #[test]
    fn push_latest_into_history_derives_the_tail() {
        let mut envelope = EventEnvelope::new_user_prompt(
            "t1",
            Message {
                role: Role::User,
                content: Arc::from("hi"),
                tool_calls: vec![],
            },
        );
        envelope.push_latest_into_history();
        assert_eq!(envelope.message_history.len(), 1);
        assert!(envelope.latest_matches_history_tail());
    }

    #[test]
    #[should_panic]
    fn new_rejects_empty_trace_id_in_debug() {
        let _ = EventEnvelope::new(EnvelopeKind::UserPrompt, "");
    }
}
