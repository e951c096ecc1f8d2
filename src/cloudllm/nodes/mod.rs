//! Node handlers — the units a [`NodeRunner`](crate::cloudllm::runner::NodeRunner) drives.
//!
//! Every handler implements [`NodeHandler`]: a list of topics to subscribe to, and a single
//! `handle` call that turns one inbound envelope into zero or more `(topic, envelope)` publishes.
//! Nodes additionally implement [`Registerable`](crate::cloudllm::topic::Registerable) to describe
//! their own wiring; [`NodeHandler::subscribe_topics`] is usually just a thin wrapper over
//! `Registerable::wiring().subscribe_topics()` plus whatever extra topics a node needs beyond the
//! four templated roles (the chat node's own output topic, for instance, which the agent router
//! also subscribes to).

pub mod agent_router_node;
pub mod chat_node;
pub mod groupchat_router_node;
pub mod tool_node;

use crate::cloudllm::envelope::EventEnvelope;
use crate::cloudllm::error::OrchestrationError;
use async_trait::async_trait;

/// A node handler: subscribes to some topics, and turns one inbound envelope into zero or more
/// outbound `(topic, envelope)` publishes.
///
/// Implementations must not hold any lock across an `.await` point other than the ones internal
/// to the handler's own state (e.g. the agent router's join buffer mutex, never held across a
/// publish).
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// All topics the node runner must subscribe to on this node's behalf.
    fn subscribe_topics(&self) -> Vec<String>;

    /// Human-readable name for logging and [`RunnerEvent`](crate::cloudllm::event::RunnerEvent)s.
    fn node_name(&self) -> &str;

    /// Handle one inbound envelope, returning the `(topic, envelope)` pairs to publish.
    ///
    /// A return of `Ok(vec![])` is valid (e.g. a tool-result folded into an incomplete join, or a
    /// duplicate dropped) — not every inbound envelope produces an outbound one.
    async fn handle(
        &self,
        envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError>;
}
