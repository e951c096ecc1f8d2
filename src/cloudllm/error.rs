//! Typed error taxonomy for the orchestration engine.
//!
//! The donor library mostly returns `Box<dyn Error>`. That's fine at an application boundary but
//! doesn't give a caller a matchable taxonomy, which the router's error handling design (protocol
//! vs. LLM vs. tool vs. transport vs. join-timeout) depends on. Each module gets its own
//! `thiserror`-derived enum; [`OrchestrationError`] composes them for anything crossing a public
//! API edge.

use thiserror::Error;

/// Malformed envelope or protocol-level violation: logged and the envelope dropped, never
/// retried.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is missing latest_message")]
    MissingLatestMessage,
    #[error("unknown envelope kind: {0}")]
    UnknownKind(String),
    #[error("pop on empty delegation stack for trace {trace_id}")]
    PopOnEmptyStack { trace_id: String },
    #[error("envelope arrived on a returnpoint with an empty delegation stack for trace {trace_id}")]
    ReturnWithEmptyStack { trace_id: String },
}

/// Tool node / tool dispatch failure.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool call targets '{expected}' but this node is '{actual}'")]
    MismatchedToolCall { expected: String, actual: String },
    #[error("no tool registered under name '{0}'")]
    UnknownTool(String),
    #[error("tool '{tool}' failed: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },
}

/// Router-level failure (classification, dispatch, join).
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("join for (trace={trace_id}, response={response_id}) timed out waiting on {missing} of {expected} tool results")]
    JoinTimeout {
        trace_id: String,
        response_id: String,
        expected: usize,
        missing: usize,
    },
}

/// LLM provider failure. Surfaced to the conversation as an error `ai_response`, not retried at
/// this layer.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider call failed: {0}")]
    ProviderFailed(String),
    #[error("provider call timed out")]
    Timeout,
}

/// Broker transport failure. Retried with bounded exponential backoff by the node runner; see
/// [`crate::cloudllm::runner`].
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is not connected")]
    NotConnected,
    #[error("no subscribers for topic '{0}'")]
    NoSubscribers(String),
    #[error("publish to '{topic}' failed: {message}")]
    PublishFailed { topic: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode/decode envelope: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Top-level error for anything crossing a public API edge.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
