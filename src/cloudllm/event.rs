//! Router and runner event system.
//!
//! Provides a callback-based observability layer over the routing engine. Implement
//! [`EventHandler`] to receive real-time notifications about:
//!
//! - **Envelope routing**: classification decisions made by the agent router and group-chat
//!   router
//! - **Tool dispatch**: tool calls sent out, results joined, timeouts
//! - **Delegation**: frames pushed/popped on the delegation stack
//! - **Group chat**: turns committed, skips recorded, unanimous-skip termination
//! - **Runner lifecycle**: node startup, topic binding, shutdown
//!
//! # Architecture
//!
//! Events flow through a single [`EventHandler`] trait with two methods:
//! - [`on_router_event`](EventHandler::on_router_event) — routing decisions made while processing
//!   one envelope
//! - [`on_runner_event`](EventHandler::on_runner_event) — node lifecycle events from
//!   [`crate::cloudllm::runner::NodeRunner`]
//!
//! Both methods have default no-op implementations, so you only override what you care about.
//! The handler is wrapped in `Arc<dyn EventHandler>` and shared across every node a runner drives.
//!
//! # Example
//!
//! ```rust,no_run
//! use cloudllm::event::{EventHandler, RouterEvent, RunnerEvent};
//! use async_trait::async_trait;
//!
//! struct MyHandler;
//!
//! #[async_trait]
//! impl EventHandler for MyHandler {
//!     async fn on_router_event(&self, event: &RouterEvent) {
//!         match event {
//!             RouterEvent::ToolDispatchStarted { trace_id, tool_name, .. } => {
//!                 println!("{trace_id}: dispatching {tool_name}");
//!             }
//!             RouterEvent::JoinTimedOut { trace_id, missing, expected, .. } => {
//!                 println!("{trace_id}: join timed out, missing {missing}/{expected}");
//!             }
//!             _ => {}
//!         }
//!     }
//!     async fn on_runner_event(&self, event: &RunnerEvent) {
//!         println!("runner: {:?}", event);
//!     }
//! }
//! ```

use async_trait::async_trait;

/// Events emitted while routing a single envelope through the agent router or group-chat router.
///
/// Every variant carries `trace_id` so handlers can correlate events with a single conversation
/// without reaching into the envelope themselves.
///
/// # Event flow (one tool call, no delegation)
///
/// ```text
/// EnvelopeReceived { kind: AiResponse }
///   └─ ToolDispatchStarted { tool_name: "calculator" }
///   └─ ToolDispatchCompleted { tool_name: "calculator", success: true }
///   └─ JoinCompleted { expected: 1 }
/// EnvelopeReceived { kind: ToolResult }
///   └─ HistoryAppended
/// ```
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// An envelope arrived at a router node and was classified.
    ///
    /// Emitted once per envelope, before any dispatch decision is acted on.
    EnvelopeReceived {
        trace_id: String,
        /// Debug-formatted `EnvelopeKind` of the envelope that arrived.
        kind: String,
        /// Depth of the delegation stack at the time of arrival.
        delegation_depth: usize,
    },

    /// A tool call was sent to its tool node.
    ///
    /// Emitted once per tool call in a model response, including each call of a K-parallel batch.
    ToolDispatchStarted {
        trace_id: String,
        response_id: Option<String>,
        tool_call_id: String,
        tool_name: String,
    },

    /// A tool call's result was received and accepted into the join buffer.
    ToolDispatchCompleted {
        trace_id: String,
        response_id: Option<String>,
        tool_call_id: String,
        tool_name: String,
        success: bool,
    },

    /// A tool result arrived for a `(trace_id, response_id)` pair the join buffer had already
    /// completed or evicted; the duplicate was dropped.
    ///
    /// Expected under at-least-once delivery; logged at debug level, not an error.
    DuplicateToolResultDropped {
        trace_id: String,
        response_id: Option<String>,
        tool_call_id: String,
    },

    /// All expected tool results for a `(trace_id, response_id)` pair arrived; the router is
    /// about to synthesize the follow-up model turn.
    JoinCompleted {
        trace_id: String,
        response_id: Option<String>,
        expected: usize,
    },

    /// The join buffer evicted a `(trace_id, response_id)` entry after its TTL elapsed without
    /// every expected tool result arriving.
    JoinTimedOut {
        trace_id: String,
        response_id: Option<String>,
        expected: usize,
        missing: usize,
    },

    /// A delegation frame was pushed onto the envelope's delegation stack.
    DelegationPushed {
        trace_id: String,
        tool_name: String,
        delegation_depth: usize,
    },

    /// A delegation frame was popped off the envelope's delegation stack and a synthesized
    /// tool-return was published back to the caller.
    DelegationPopped {
        trace_id: String,
        tool_name: String,
        delegation_depth: usize,
    },

    /// `latest_message` was appended to `message_history` by the agent router.
    HistoryAppended { trace_id: String, role: String },

    /// The final answer was published to `final_response_topic` (delegation stack empty).
    FinalResponsePublished { trace_id: String, topic: String },

    /// The group-chat router committed the current uncommitted turn and advanced `turn_index`.
    GroupchatTurnCommitted {
        trace_id: String,
        turn_index: i64,
        participant_topic: String,
        skipped: bool,
    },

    /// Unanimous skip reached (`consecutive_skips == participant_count`); the group chat is
    /// terminating.
    GroupchatTerminated {
        trace_id: String,
        participant_count: usize,
    },
}

/// Events emitted by a [`NodeRunner`](crate::cloudllm::runner::NodeRunner) over its own lifetime,
/// independent of any single envelope.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// A node finished binding its subscriptions and started consuming.
    NodeStarted {
        node_name: Option<String>,
        subscribed_topics: Vec<String>,
    },

    /// A publish to the broker failed and is being retried with backoff.
    PublishRetrying {
        topic: String,
        attempt: usize,
        error: String,
    },

    /// A publish exhausted its retry budget and was dropped.
    PublishAbandoned { topic: String, attempts: usize },

    /// Cooperative shutdown was requested (SIGINT/SIGTERM observed).
    ShutdownRequested,

    /// Every node this runner drives has stopped consuming.
    ShutdownCompleted,
}

/// Trait for receiving router and runner events.
///
/// Both methods have **default no-op implementations**, so you only need to override the events
/// you care about.
///
/// # Thread safety
///
/// The `Send + Sync` bound allows the handler to be shared across node tasks via
/// `Arc<dyn EventHandler>`. Make sure any internal state uses appropriate synchronization.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called when a router node emits an event while processing an envelope.
    async fn on_router_event(&self, _event: &RouterEvent) {}

    /// Called when a node runner emits a lifecycle event.
    async fn on_runner_event(&self, _event: &RunnerEvent) {}
}

/// An [`EventHandler`] that logs every event at debug level via the `log` facade, matching the
/// teacher's convention of pairing structured events with a plain log line.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_router_event(&self, event: &RouterEvent) {
        log::debug!("router event: {event:?}");
    }

    async fn on_runner_event(&self, event: &RunnerEvent) {
        log::debug!("runner event: {event:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        router_events: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn on_router_event(&self, _event: &RouterEvent) {
            self.router_events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn default_on_runner_event_is_a_no_op() {
        let handler = CountingHandler {
            router_events: AtomicUsize::new(0),
        };
        handler.on_runner_event(&RunnerEvent::ShutdownRequested).await;
        handler
            .on_router_event(&RouterEvent::EnvelopeReceived {
                trace_id: "t1".into(),
                kind: "ai_response".into(),
                delegation_depth: 0,
            })
            .await;
        assert_eq!(handler.router_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn logging_handler_accepts_arc_dyn() {
        let handler: Arc<dyn EventHandler> = Arc::new(LoggingEventHandler);
        handler
            .on_runner_event(&RunnerEvent::ShutdownCompleted)
            .await;
    }
}
