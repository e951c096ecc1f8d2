//! Agent router node — the state machine that classifies inbound envelopes, dispatches tool
//! calls, joins parallel tool results, and drives the delegation stack.
//!
//! Grounded on `examples/original_source/calfkit/models/delegation.py` for the push/pop frame
//! shape, on `src/cloudllm/agent.rs`'s `send()` tool loop for the parallel-dispatch-then-fan-in
//! pattern, and on `examples/swedishembedded-sven/crates/sven-core/src/agent.rs`'s
//! `pending_tcs: HashMap<u32, ..>` keyed join-with-timeout for the join buffer shape.

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::cloudllm::envelope::{
    DelegationFrame, EnvelopeKind, EventEnvelope, LatestMessage, ToolCallPart, ToolReturnPart,
};
use crate::cloudllm::error::{EnvelopeError, OrchestrationError};
use crate::cloudllm::event::{EventHandler, RouterEvent};
use crate::cloudllm::nodes::NodeHandler;
use crate::cloudllm::topic::{resolve_template, templates, NodeWiring, Registerable};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One `(trace_id, response_id)` join in flight: the set of tool calls dispatched for one model
/// turn, waiting on their results before the router can forward a synthesized turn to `chat.in`.
struct JoinEntry {
    expected_calls: Vec<ToolCallPart>,
    arrived_order: Vec<String>,
    received: HashMap<String, ToolReturnPart>,
    envelope_template: EventEnvelope,
    deadline: Instant,
}

/// Outcome of recording one tool result against a join entry.
enum JoinOutcome {
    /// Still waiting on other expected results.
    Waiting,
    /// A result arrived for a `tool_call_id` already recorded, or for a join that no longer
    /// exists (already completed or evicted) — dropped, not double-counted.
    Duplicate,
    /// Every expected result arrived; here's the envelope ready to forward to `chat.in`.
    Complete(EventEnvelope),
}

/// Keyed by `(trace_id, response_id)`, TTL-evicting fan-in buffer for K-parallel tool calls.
struct JoinBuffer {
    entries: Mutex<HashMap<(String, String), JoinEntry>>,
    ttl: Duration,
}

impl JoinBuffer {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    async fn open(
        &self,
        trace_id: &str,
        response_id: &str,
        expected_calls: Vec<ToolCallPart>,
        envelope_template: EventEnvelope,
    ) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (trace_id.to_string(), response_id.to_string()),
            JoinEntry {
                expected_calls,
                arrived_order: Vec::new(),
                received: HashMap::new(),
                envelope_template,
                deadline: Instant::now() + self.ttl,
            },
        );
    }

    async fn record(&self, trace_id: &str, response_id: &str, part: ToolReturnPart) -> JoinOutcome {
        let key = (trace_id.to_string(), response_id.to_string());
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&key) else {
            return JoinOutcome::Duplicate;
        };
        if entry.received.contains_key(&part.tool_call_id) {
            return JoinOutcome::Duplicate;
        }
        entry.arrived_order.push(part.tool_call_id.clone());
        entry.received.insert(part.tool_call_id.clone(), part);
        if entry.received.len() < entry.expected_calls.len() {
            return JoinOutcome::Waiting;
        }
        let entry = entries.remove(&key).expect("just matched above");
        let template = entry.envelope_template.clone();
        JoinOutcome::Complete(fold_into_chat_in_envelope(template, &entry))
    }

    /// Evict every entry past its deadline, synthesizing error tool-returns for calls that never
    /// arrived so the conversation can still proceed.
    async fn sweep(&self) -> Vec<(String, String, usize, EventEnvelope)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let expired_keys: Vec<_> = entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut out = Vec::new();
        for key in expired_keys {
            let entry = entries.remove(&key).expect("just matched above");
            let expected = entry.expected_calls.len();
            let mut envelope = fold_into_chat_in_envelope(entry.envelope_template.clone(), &entry);
            for call in &entry.expected_calls {
                if entry.received.contains_key(&call.tool_call_id) {
                    continue;
                }
                envelope.latest_message = Some(LatestMessage::ToolReturn(ToolReturnPart {
                    tool_call_id: call.tool_call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    content: "join timed out waiting for this tool's result".to_string(),
                    is_error: true,
                }));
                envelope.push_latest_into_history();
            }
            out.push((key.0, key.1, expected, envelope));
        }
        out
    }
}

/// Append every received tool-return into the template envelope's history, in arrival order, and
/// leave `latest_message` pointing at the last one appended.
fn fold_into_chat_in_envelope(mut envelope: EventEnvelope, entry: &JoinEntry) -> EventEnvelope {
    for call_id in &entry.arrived_order {
        let part = entry.received.get(call_id).expect("recorded in arrived_order").clone();
        envelope.latest_message = Some(LatestMessage::ToolReturn(part));
        envelope.push_latest_into_history();
    }
    envelope
}

/// Which tools are regular (dispatched to a `tool.in.{name}` topic) vs. delegations (dispatched to
/// a sub-agent's entrypoint, with a frame pushed onto the delegation stack).
pub enum ToolRoute {
    Regular,
    Delegation { sub_agent_entrypoint_topic: String },
}

/// The agent router's own wiring plus its view of the tools it can dispatch.
pub struct AgentRouterNode {
    name: String,
    wiring: NodeWiring,
    chat_in_topic: String,
    chat_out_topic: String,
    routes: HashMap<String, ToolRoute>,
    join_buffer: JoinBuffer,
    event_handler: Arc<dyn EventHandler>,
}

impl AgentRouterNode {
    pub fn new(
        name: impl Into<String>,
        routes: HashMap<String, ToolRoute>,
        join_timeout: Duration,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        let name = name.into();
        let wiring = NodeWiring {
            shared_subscribe_topic: Some(resolve_template(templates::AGENT_PUBLIC, &name)),
            entrypoint_topic: Some(resolve_template(templates::AGENT_PRIVATE, &name)),
            returnpoint_topic: Some(resolve_template(templates::AGENT_RETURN, &name)),
            publish_topic: None,
        };
        Self {
            name,
            wiring,
            chat_in_topic: templates::CHAT_IN.to_string(),
            chat_out_topic: templates::CHAT_OUT.to_string(),
            routes,
            join_buffer: JoinBuffer::new(join_timeout),
            event_handler,
        }
    }

    /// Run the join buffer's TTL sweep once, returning `(topic, envelope)` pairs to publish for
    /// any entries that timed out. Intended to be called periodically by
    /// [`crate::cloudllm::runner::NodeRunner`] on [`crate::cloudllm::config::RuntimeConfig::join_sweep_interval`].
    pub async fn sweep_joins(&self) -> Vec<(String, EventEnvelope)> {
        let expired = self.join_buffer.sweep().await;
        let mut out = Vec::with_capacity(expired.len());
        for (trace_id, response_id, expected, envelope) in expired {
            let missing = expected - envelope_join_received_count(&envelope, expected);
            self.event_handler
                .on_router_event(&RouterEvent::JoinTimedOut {
                    trace_id,
                    response_id: Some(response_id),
                    expected,
                    missing,
                })
                .await;
            out.push((self.chat_in_topic.clone(), envelope));
        }
        out
    }

    async fn dispatch_tool_calls(
        &self,
        envelope: EventEnvelope,
        tool_calls: Vec<ToolCallPart>,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        let trace_id = envelope.trace_id.clone();
        let response_id = envelope
            .response_id
            .clone()
            .unwrap_or_else(|| trace_id.clone());

        // Everything after dispatch publishes to join-tracked topics except unknown tools, which
        // are resolved immediately (no publish) but still must be recorded into the join so the
        // batch completes once the other calls' real results arrive.
        let mut unknown_results = Vec::new();
        for call in &tool_calls {
            if !self.routes.contains_key(&call.tool_name) {
                unknown_results.push(ToolReturnPart {
                    tool_call_id: call.tool_call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    content: format!("no such tool: {}", call.tool_name),
                    is_error: true,
                });
            }
        }

        let mut chat_template = envelope.derive(EnvelopeKind::ToolResult, None);
        chat_template.response_id = Some(response_id.clone());
        self.join_buffer
            .open(&trace_id, &response_id, tool_calls.clone(), chat_template)
            .await;

        let mut outputs = Vec::new();
        for call in &tool_calls {
            match self.routes.get(&call.tool_name) {
                Some(ToolRoute::Regular) => {
                    self.event_handler
                        .on_router_event(&RouterEvent::ToolDispatchStarted {
                            trace_id: trace_id.clone(),
                            response_id: Some(response_id.clone()),
                            tool_call_id: call.tool_call_id.clone(),
                            tool_name: call.tool_name.clone(),
                        })
                        .await;
                    let tool_in_topic = resolve_template(templates::TOOL_IN, &call.tool_name);
                    let request = envelope.derive(
                        EnvelopeKind::ToolCallRequest,
                        Some(LatestMessage::ToolCall(call.clone())),
                    );
                    outputs.push((tool_in_topic, request));
                }
                Some(ToolRoute::Delegation {
                    sub_agent_entrypoint_topic,
                }) => {
                    self.event_handler
                        .on_router_event(&RouterEvent::DelegationPushed {
                            trace_id: trace_id.clone(),
                            tool_name: call.tool_name.clone(),
                            delegation_depth: envelope.delegation_stack.len() + 1,
                        })
                        .await;
                    let frame = DelegationFrame {
                        caller_private_topic: self
                            .wiring
                            .entrypoint_topic
                            .clone()
                            .expect("agent router always has an entrypoint"),
                        caller_final_response_topic: envelope.final_response_topic.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        caller_response_id: Some(response_id.clone()),
                    };
                    let mut sub_prompt = envelope.derive(
                        EnvelopeKind::UserPrompt,
                        Some(LatestMessage::UserInput(Message {
                            role: Role::User,
                            content: std::sync::Arc::from(
                                call.arguments
                                    .get("prompt")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default(),
                            ),
                            tool_calls: vec![],
                        })),
                    );
                    sub_prompt.push_delegation_frame(frame);
                    sub_prompt.final_response_topic =
                        self.wiring.returnpoint_topic.clone();
                    outputs.push((sub_agent_entrypoint_topic.clone(), sub_prompt));
                }
                None => {} // recorded into the join directly below, no dispatch
            }
        }

        for result in unknown_results {
            match self.join_buffer.record(&trace_id, &response_id, result).await {
                JoinOutcome::Complete(chat_envelope) => {
                    self.event_handler
                        .on_router_event(&RouterEvent::JoinCompleted {
                            trace_id: trace_id.clone(),
                            response_id: Some(response_id.clone()),
                            expected: tool_calls.len(),
                        })
                        .await;
                    outputs.push((self.chat_in_topic.clone(), chat_envelope));
                }
                JoinOutcome::Waiting | JoinOutcome::Duplicate => {}
            }
        }

        Ok(outputs)
    }

    async fn handle_tool_result(
        &self,
        envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        let part = match &envelope.latest_message {
            Some(LatestMessage::ToolReturn(part)) => part.clone(),
            _ => return Err(EnvelopeError::MissingLatestMessage.into()),
        };
        let response_id = envelope
            .response_id
            .clone()
            .ok_or(EnvelopeError::MissingLatestMessage)?;

        self.event_handler
            .on_router_event(&RouterEvent::ToolDispatchCompleted {
                trace_id: envelope.trace_id.clone(),
                response_id: Some(response_id.clone()),
                tool_call_id: part.tool_call_id.clone(),
                tool_name: part.tool_name.clone(),
                success: !part.is_error,
            })
            .await;

        match self
            .join_buffer
            .record(&envelope.trace_id, &response_id, part.clone())
            .await
        {
            JoinOutcome::Complete(chat_envelope) => {
                self.event_handler
                    .on_router_event(&RouterEvent::JoinCompleted {
                        trace_id: envelope.trace_id.clone(),
                        response_id: Some(response_id),
                        expected: chat_envelope.message_history.len(),
                    })
                    .await;
                Ok(vec![(self.chat_in_topic.clone(), chat_envelope)])
            }
            JoinOutcome::Waiting => Ok(vec![]),
            JoinOutcome::Duplicate => {
                self.event_handler
                    .on_router_event(&RouterEvent::DuplicateToolResultDropped {
                        trace_id: envelope.trace_id.clone(),
                        response_id: Some(response_id),
                        tool_call_id: part.tool_call_id,
                    })
                    .await;
                Ok(vec![])
            }
        }
    }

    async fn handle_ai_response(
        &self,
        mut envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        let tool_calls = envelope
            .latest_message
            .as_ref()
            .map(|m| m.tool_calls().to_vec())
            .unwrap_or_default();

        if !tool_calls.is_empty() {
            return self.dispatch_tool_calls(envelope, tool_calls).await;
        }

        if envelope.delegation_stack.is_empty() {
            let topic = envelope
                .final_response_topic
                .clone()
                .ok_or(EnvelopeError::MissingLatestMessage)?;
            self.event_handler
                .on_router_event(&RouterEvent::FinalResponsePublished {
                    trace_id: envelope.trace_id.clone(),
                    topic: topic.clone(),
                })
                .await;
            return Ok(vec![(topic, envelope)]);
        }

        let frame = envelope.pop_delegation_frame().ok_or_else(|| {
            EnvelopeError::PopOnEmptyStack {
                trace_id: envelope.trace_id.clone(),
            }
        })?;
        self.event_handler
            .on_router_event(&RouterEvent::DelegationPopped {
                trace_id: envelope.trace_id.clone(),
                tool_name: frame.tool_name.clone(),
                delegation_depth: envelope.delegation_stack.len(),
            })
            .await;
        let answer_text = envelope
            .latest_message
            .as_ref()
            .map(|m| m.text().to_string())
            .unwrap_or_default();
        envelope.final_response_topic = frame.caller_final_response_topic.clone();
        envelope.response_id = frame.caller_response_id.clone();
        let tool_return = ToolReturnPart {
            tool_call_id: frame.tool_call_id.clone(),
            tool_name: frame.tool_name.clone(),
            content: answer_text,
            is_error: false,
        };
        let out = envelope.derive(EnvelopeKind::ToolResult, Some(LatestMessage::ToolReturn(tool_return)));
        Ok(vec![(frame.caller_private_topic, out)])
    }
}

fn envelope_join_received_count(envelope: &EventEnvelope, _expected: usize) -> usize {
    // Best-effort count of real (non-synthesized-timeout) returns already folded into history;
    // exact accounting lives in JoinEntry, which is gone by the time this runs. Not load-bearing
    // for routing — only used to size the `missing` field on the timeout event.
    envelope
        .message_history
        .iter()
        .filter(|m| matches!(m.role, crate::cloudllm::client_wrapper::Role::Tool { .. }))
        .count()
}

impl Registerable for AgentRouterNode {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn wiring(&self) -> NodeWiring {
        self.wiring.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::event::LoggingEventHandler;

    fn router(routes: HashMap<String, ToolRoute>) -> AgentRouterNode {
        AgentRouterNode::new("chat", routes, Duration::from_millis(20), Arc::new(LoggingEventHandler))
    }

    fn user_prompt(text: &str) -> EventEnvelope {
        let mut envelope = EventEnvelope::new_user_prompt(
            "trace-1",
            Message {
                role: Role::User,
                content: std::sync::Arc::from(text),
                tool_calls: vec![],
            },
        );
        envelope.final_response_topic = Some("final.out".to_string());
        envelope
    }

    fn ai_response_with_calls(mut envelope: EventEnvelope, calls: Vec<ToolCallPart>) -> EventEnvelope {
        envelope.response_id = Some("resp-1".to_string());
        envelope.derive(
            EnvelopeKind::AiResponse,
            Some(LatestMessage::ModelResponse {
                message: Message {
                    role: Role::Assistant,
                    content: std::sync::Arc::from(""),
                    tool_calls: vec![],
                },
                tool_calls: calls,
            }),
        )
    }

    #[tokio::test]
    async fn user_prompt_is_appended_to_history_and_forwarded_to_chat_in() {
        let node = router(HashMap::new());
        let out = node.handle(user_prompt("hello")).await.unwrap();
        assert_eq!(out.len(), 1);
        let (topic, envelope) = &out[0];
        assert_eq!(topic, "chat.in");
        assert_eq!(envelope.message_history.len(), 1);
        assert_eq!(envelope.message_history[0].content.as_ref(), "hello");
    }

    #[tokio::test]
    async fn text_only_ai_response_with_no_delegation_publishes_the_final_answer() {
        let node = router(HashMap::new());
        let mut envelope = user_prompt("hello");
        envelope.push_latest_into_history();
        let reply = envelope.derive(
            EnvelopeKind::AiResponse,
            Some(LatestMessage::ModelResponse {
                message: Message {
                    role: Role::Assistant,
                    content: std::sync::Arc::from("hi there"),
                    tool_calls: vec![],
                },
                tool_calls: vec![],
            }),
        );
        let mut out = node.handle(reply).await.unwrap();
        assert_eq!(out.len(), 1);
        let (topic, envelope) = out.remove(0);
        assert_eq!(topic, "final.out");
        assert_eq!(envelope.kind, EnvelopeKind::AiResponse);
    }

    #[tokio::test]
    async fn two_regular_tool_calls_are_dispatched_to_their_own_topics() {
        let mut routes = HashMap::new();
        routes.insert("a".to_string(), ToolRoute::Regular);
        routes.insert("b".to_string(), ToolRoute::Regular);
        let node = router(routes);

        let reply = ai_response_with_calls(
            user_prompt("do both"),
            vec![
                ToolCallPart { tool_call_id: "c1".into(), tool_name: "a".into(), arguments: serde_json::json!({}) },
                ToolCallPart { tool_call_id: "c2".into(), tool_name: "b".into(), arguments: serde_json::json!({}) },
            ],
        );
        let out = node.handle(reply).await.unwrap();
        assert_eq!(out.len(), 2);
        let topics: Vec<&str> = out.iter().map(|(t, _)| t.as_str()).collect();
        assert!(topics.contains(&"tool.in.a"));
        assert!(topics.contains(&"tool.in.b"));
    }

    #[tokio::test]
    async fn parallel_results_join_into_one_envelope_in_arrival_order() {
        let mut routes = HashMap::new();
        routes.insert("a".to_string(), ToolRoute::Regular);
        routes.insert("b".to_string(), ToolRoute::Regular);
        let node = router(routes);

        let reply = ai_response_with_calls(
            user_prompt("do both"),
            vec![
                ToolCallPart { tool_call_id: "c1".into(), tool_name: "a".into(), arguments: serde_json::json!({}) },
                ToolCallPart { tool_call_id: "c2".into(), tool_name: "b".into(), arguments: serde_json::json!({}) },
            ],
        );
        node.handle(reply).await.unwrap();

        let mut result_b = EventEnvelope::new(EnvelopeKind::ToolResult, "trace-1");
        result_b.response_id = Some("resp-1".to_string());
        result_b.latest_message = Some(LatestMessage::ToolReturn(ToolReturnPart {
            tool_call_id: "c2".into(),
            tool_name: "b".into(),
            content: "second".into(),
            is_error: false,
        }));
        let out = node.handle(result_b).await.unwrap();
        assert!(out.is_empty(), "join should still be waiting on call c1");

        let mut result_a = EventEnvelope::new(EnvelopeKind::ToolResult, "trace-1");
        result_a.response_id = Some("resp-1".to_string());
        result_a.latest_message = Some(LatestMessage::ToolReturn(ToolReturnPart {
            tool_call_id: "c1".into(),
            tool_name: "a".into(),
            content: "first".into(),
            is_error: false,
        }));
        let mut out = node.handle(result_a).await.unwrap();
        assert_eq!(out.len(), 1);
        let (topic, envelope) = out.remove(0);
        assert_eq!(topic, "chat.in");
        let tool_messages: Vec<&str> = envelope
            .message_history
            .iter()
            .filter(|m| matches!(m.role, Role::Tool { .. }))
            .map(|m| m.content.as_ref())
            .collect();
        assert_eq!(tool_messages, vec!["second", "first"], "folded in arrival order, not call order");
    }

    #[tokio::test]
    async fn duplicate_tool_result_is_dropped_not_double_counted() {
        let mut routes = HashMap::new();
        routes.insert("a".to_string(), ToolRoute::Regular);
        let node = router(routes);

        let reply = ai_response_with_calls(
            user_prompt("once"),
            vec![ToolCallPart { tool_call_id: "c1".into(), tool_name: "a".into(), arguments: serde_json::json!({}) }],
        );
        node.handle(reply).await.unwrap();

        let mut result = EventEnvelope::new(EnvelopeKind::ToolResult, "trace-1");
        result.response_id = Some("resp-1".to_string());
        result.latest_message = Some(LatestMessage::ToolReturn(ToolReturnPart {
            tool_call_id: "c1".into(),
            tool_name: "a".into(),
            content: "ok".into(),
            is_error: false,
        }));
        let out = node.handle(result.clone()).await.unwrap();
        assert_eq!(out.len(), 1, "first arrival completes the join");

        let out_again = node.handle(result).await.unwrap();
        assert!(out_again.is_empty(), "redelivery of the same result must not republish");
    }

    #[tokio::test]
    async fn unknown_tool_is_folded_into_the_join_without_dispatch() {
        let node = router(HashMap::new());
        let reply = ai_response_with_calls(
            user_prompt("call a fake tool"),
            vec![ToolCallPart {
                tool_call_id: "c1".into(),
                tool_name: "nonexistent".into(),
                arguments: serde_json::json!({}),
            }],
        );
        let mut out = node.handle(reply).await.unwrap();
        assert_eq!(out.len(), 1);
        let (topic, envelope) = out.remove(0);
        assert_eq!(topic, "chat.in");
        let tool_message = envelope
            .message_history
            .iter()
            .find(|m| matches!(m.role, Role::Tool { .. }))
            .unwrap();
        assert!(tool_message.content.contains("no such tool"));
    }

    #[tokio::test]
    async fn delegation_pushes_a_frame_and_addresses_the_sub_agent_entrypoint() {
        let mut routes = HashMap::new();
        routes.insert(
            "ask_billing".to_string(),
            ToolRoute::Delegation { sub_agent_entrypoint_topic: "agent.private.billing".to_string() },
        );
        let node = router(routes);

        let reply = ai_response_with_calls(
            user_prompt("ask billing"),
            vec![ToolCallPart {
                tool_call_id: "c1".into(),
                tool_name: "ask_billing".into(),
                arguments: serde_json::json!({"prompt": "what's my balance?"}),
            }],
        );
        let mut out = node.handle(reply).await.unwrap();
        assert_eq!(out.len(), 1);
        let (topic, envelope) = out.remove(0);
        assert_eq!(topic, "agent.private.billing");
        assert_eq!(envelope.kind, EnvelopeKind::UserPrompt);
        assert_eq!(envelope.delegation_stack.len(), 1);
        assert_eq!(envelope.delegation_stack[0].caller_response_id.as_deref(), Some("resp-1"));
        assert_eq!(envelope.final_response_topic.as_deref(), Some("agent.return.chat"));
        match envelope.latest_message {
            Some(LatestMessage::UserInput(m)) => assert_eq!(m.content.as_ref(), "what's my balance?"),
            other => panic!("unexpected latest_message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_synthesizes_an_error_return_for_a_call_that_never_arrives() {
        let mut routes = HashMap::new();
        routes.insert("a".to_string(), ToolRoute::Regular);
        routes.insert("b".to_string(), ToolRoute::Regular);
        let node = router(routes);

        let reply = ai_response_with_calls(
            user_prompt("do both"),
            vec![
                ToolCallPart { tool_call_id: "c1".into(), tool_name: "a".into(), arguments: serde_json::json!({}) },
                ToolCallPart { tool_call_id: "c2".into(), tool_name: "b".into(), arguments: serde_json::json!({}) },
            ],
        );
        node.handle(reply).await.unwrap();

        let mut result_a = EventEnvelope::new(EnvelopeKind::ToolResult, "trace-1");
        result_a.response_id = Some("resp-1".to_string());
        result_a.latest_message = Some(LatestMessage::ToolReturn(ToolReturnPart {
            tool_call_id: "c1".into(),
            tool_name: "a".into(),
            content: "first".into(),
            is_error: false,
        }));
        node.handle(result_a).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let swept = node.sweep_joins().await;
        assert_eq!(swept.len(), 1);
        let (topic, envelope) = &swept[0];
        assert_eq!(topic, "chat.in");
        let contents: Vec<&str> = envelope
            .message_history
            .iter()
            .filter(|m| matches!(m.role, Role::Tool { .. }))
            .map(|m| m.content.as_ref())
            .collect();
        assert_eq!(contents, vec!["first", "join timed out waiting for this tool's result"]);
    }
}

#[async_trait]
impl NodeHandler for AgentRouterNode {
    fn subscribe_topics(&self) -> Vec<String> {
        let mut topics = self.wiring.subscribe_topics();
        topics.push(self.chat_out_topic.clone());
        for (tool_name, route) in &self.routes {
            if let ToolRoute::Regular = route {
                topics.push(resolve_template(templates::TOOL_OUT, tool_name));
            }
        }
        topics
    }

    fn node_name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        mut envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        self.event_handler
            .on_router_event(&RouterEvent::EnvelopeReceived {
                trace_id: envelope.trace_id.clone(),
                kind: format!("{:?}", envelope.kind),
                delegation_depth: envelope.delegation_stack.len(),
            })
            .await;

        match envelope.kind {
            EnvelopeKind::UserPrompt => {
                envelope.push_latest_into_history();
                self.event_handler
                    .on_router_event(&RouterEvent::HistoryAppended {
                        trace_id: envelope.trace_id.clone(),
                        role: "user".to_string(),
                    })
                    .await;
                let out = envelope.derive(envelope.kind, envelope.latest_message.clone());
                Ok(vec![(self.chat_in_topic.clone(), out)])
            }
            EnvelopeKind::AiResponse => {
                envelope.push_latest_into_history();
                self.handle_ai_response(envelope).await
            }
            EnvelopeKind::ToolResult => self.handle_tool_result(envelope).await,
            EnvelopeKind::ToolCallRequest => {
                Err(EnvelopeError::UnknownKind("tool_call_request at agent router".into()).into())
            }
            EnvelopeKind::EndOfTurn => Ok(vec![]),
        }
    }
}
