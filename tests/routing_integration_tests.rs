//! End-to-end tests wiring a real in-memory broker and node runner through chat, tool,
//! agent-router, and group-chat router nodes. Each test drives one routing scenario: simple Q&A,
//! a single tool call, parallel tool calls, delegation, an unknown-tool short-circuit, and a
//! 3-agent group chat through two full rounds before unanimous-skip termination.

use async_trait::async_trait;
use cloudllm::cloudllm::broker::{Broker, InMemoryBroker};
use cloudllm::cloudllm::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, ToolDefinition};
use cloudllm::cloudllm::config::RuntimeConfig;
use cloudllm::cloudllm::envelope::{EnvelopeKind, EventEnvelope};
use cloudllm::cloudllm::event::LoggingEventHandler;
use cloudllm::cloudllm::nodes::agent_router_node::{AgentRouterNode, ToolRoute};
use cloudllm::cloudllm::nodes::chat_node::ChatNode;
use cloudllm::cloudllm::nodes::groupchat_router_node::GroupchatRouterNode;
use cloudllm::cloudllm::nodes::tool_node::ToolNode;
use cloudllm::cloudllm::nodes::NodeHandler;
use cloudllm::cloudllm::runner::NodeRunner;
use cloudllm::cloudllm::tool_protocol::{
    Tool, ToolError as ProtoToolError, ToolMetadata, ToolProtocol, ToolRegistry,
    ToolResult as ProtoToolResult,
};
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Returns the next scripted reply on every call, except that a turn whose last history message is
/// a tool-return always short-circuits to `final_text` — the multi-call scenarios only need to
/// script the turn(s) before the join completes.
struct ScriptedClient {
    script: std::sync::Mutex<Vec<Reply>>,
    final_text: String,
}

enum Reply {
    Text(String),
    ToolCalls(Vec<(&'static str, &'static str, JsonValue)>),
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
        _request_params: Option<&JsonValue>,
        _model_settings: Option<&JsonValue>,
    ) -> Result<Message, Box<dyn Error>> {
        if matches!(messages.last().map(|m| &m.role), Some(Role::Tool { .. })) {
            return Ok(Message {
                role: Role::Assistant,
                content: Arc::from(self.final_text.as_str()),
                tool_calls: vec![],
            });
        }
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Reply::Text(self.final_text.clone()));
        match reply {
            Reply::Text(text) => Ok(Message {
                role: Role::Assistant,
                content: Arc::from(text.as_str()),
                tool_calls: vec![],
            }),
            Reply::ToolCalls(calls) => Ok(Message {
                role: Role::Assistant,
                content: Arc::from(""),
                tool_calls: calls
                    .into_iter()
                    .map(|(id, name, arguments)| NativeToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments,
                    })
                    .collect(),
            }),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn scripted_client(script: Vec<Reply>, final_text: &str) -> Arc<ScriptedClient> {
    // Reversed so `pop()` yields the entries in the order they were given.
    let mut script = script;
    script.reverse();
    Arc::new(ScriptedClient {
        script: std::sync::Mutex::new(script),
        final_text: final_text.to_string(),
    })
}

struct EchoProtocol;

#[async_trait]
impl ToolProtocol for EchoProtocol {
    async fn execute(
        &self,
        _tool_name: &str,
        parameters: JsonValue,
    ) -> Result<ProtoToolResult, Box<dyn Error + Send + Sync>> {
        Ok(ProtoToolResult::success(parameters))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![])
    }

    async fn get_tool_metadata(
        &self,
        tool_name: &str,
    ) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        Err(Box::new(ProtoToolError::NotFound(tool_name.to_string())))
    }

    fn protocol_name(&self) -> &str {
        "echo"
    }
}

fn registry_with_tools(names: &[&str]) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new(Arc::new(EchoProtocol));
    for name in names {
        registry.add_tool(Tool::new(*name, "a test tool", Arc::new(EchoProtocol)));
    }
    Arc::new(registry)
}

async fn send_user_prompt(broker: &Arc<dyn Broker>, topic: &str, trace_id: &str, text: &str, final_topic: &str) {
    let mut envelope = EventEnvelope::new_user_prompt(
        trace_id,
        Message {
            role: Role::User,
            content: Arc::from(text),
            tool_calls: vec![],
        },
    );
    envelope.final_response_topic = Some(final_topic.to_string());
    broker
        .publish(topic, serde_json::to_vec(&envelope).unwrap(), trace_id)
        .await
        .unwrap();
}

async fn wait_for_final(broker: &Arc<dyn Broker>, topic: &str) -> EventEnvelope {
    let mut stream = broker.subscribe(topic);
    let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("final response should arrive within 5s")
        .expect("broker should not close the stream");
    serde_json::from_slice(&message.payload).unwrap()
}

#[tokio::test]
async fn simple_question_answer_round_trips_through_chat_and_router() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let client = scripted_client(vec![Reply::Text("hi there".to_string())], "hi there");
    let registry = registry_with_tools(&[]);
    let event_handler = Arc::new(LoggingEventHandler);

    let mut runner = NodeRunner::new(Arc::clone(&broker), RuntimeConfig::default(), event_handler.clone());
    runner.register_node(Arc::new(ChatNode::new(client, registry)) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::new(AgentRouterNode::new(
        "chat",
        HashMap::new(),
        Duration::from_secs(5),
        event_handler.clone(),
    )) as Arc<dyn NodeHandler>);
    let shutdown = runner.shutdown_handle();
    let handle = tokio::spawn(runner.run());

    send_user_prompt(&broker, "agent.public.chat", "t-s1", "hello", "final.s1").await;
    let answer = wait_for_final(&broker, "final.s1").await;

    assert_eq!(answer.kind, EnvelopeKind::AiResponse);
    assert_eq!(
        answer.latest_message.map(|m| m.text().to_string()),
        Some("hi there".to_string())
    );

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn single_tool_call_is_dispatched_and_joined_before_the_final_answer() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let client = scripted_client(
        vec![Reply::ToolCalls(vec![("call_1", "get_time", serde_json::json!({}))])],
        "it is noon",
    );
    let registry = registry_with_tools(&["get_time"]);
    let event_handler = Arc::new(LoggingEventHandler);

    let mut routes = HashMap::new();
    routes.insert("get_time".to_string(), ToolRoute::Regular);

    let mut runner = NodeRunner::new(Arc::clone(&broker), RuntimeConfig::default(), event_handler.clone());
    runner.register_node(Arc::new(ChatNode::new(client, Arc::clone(&registry))) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::new(AgentRouterNode::new(
        "chat",
        routes,
        Duration::from_secs(5),
        event_handler.clone(),
    )) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::new(ToolNode::new("get_time", registry)) as Arc<dyn NodeHandler>);
    let shutdown = runner.shutdown_handle();
    let handle = tokio::spawn(runner.run());

    send_user_prompt(&broker, "agent.public.chat", "t-s2", "what time is it?", "final.s2").await;
    let answer = wait_for_final(&broker, "final.s2").await;

    assert_eq!(
        answer.latest_message.map(|m| m.text().to_string()),
        Some("it is noon".to_string())
    );
    let tool_messages = answer
        .message_history
        .iter()
        .filter(|m| matches!(m.role, Role::Tool { .. }))
        .count();
    assert_eq!(tool_messages, 1);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn parallel_tool_calls_join_into_one_turn_before_the_final_answer() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let client = scripted_client(
        vec![Reply::ToolCalls(vec![
            ("call_a", "tool_a", serde_json::json!({})),
            ("call_b", "tool_b", serde_json::json!({})),
        ])],
        "both done",
    );
    let registry = registry_with_tools(&["tool_a", "tool_b"]);
    let event_handler = Arc::new(LoggingEventHandler);

    let mut routes = HashMap::new();
    routes.insert("tool_a".to_string(), ToolRoute::Regular);
    routes.insert("tool_b".to_string(), ToolRoute::Regular);

    let mut runner = NodeRunner::new(Arc::clone(&broker), RuntimeConfig::default(), event_handler.clone());
    runner.register_node(Arc::new(ChatNode::new(client, Arc::clone(&registry))) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::new(AgentRouterNode::new(
        "chat",
        routes,
        Duration::from_secs(5),
        event_handler.clone(),
    )) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::new(ToolNode::new("tool_a", Arc::clone(&registry))) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::new(ToolNode::new("tool_b", registry)) as Arc<dyn NodeHandler>);
    let shutdown = runner.shutdown_handle();
    let handle = tokio::spawn(runner.run());

    send_user_prompt(&broker, "agent.public.chat", "t-s3", "do both", "final.s3").await;
    let answer = wait_for_final(&broker, "final.s3").await;

    assert_eq!(
        answer.latest_message.map(|m| m.text().to_string()),
        Some("both done".to_string())
    );
    let tool_messages = answer
        .message_history
        .iter()
        .filter(|m| matches!(m.role, Role::Tool { .. }))
        .count();
    assert_eq!(tool_messages, 2, "both tool returns must land in one joined turn");

    shutdown.trigger();
    handle.await.unwrap();
}

/// A client whose reply depends on the shape of the turn rather than call order, so one client
/// instance can drive both the delegating side and the delegated side of a self-referential
/// delegation route (see `delegation_round_trip_restores_final_topic_and_pops_the_stack`).
struct ContentAwareClient;

#[async_trait]
impl ClientWrapper for ContentAwareClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
        _request_params: Option<&JsonValue>,
        _model_settings: Option<&JsonValue>,
    ) -> Result<Message, Box<dyn Error>> {
        match messages.last() {
            Some(m) if matches!(m.role, Role::Tool { .. }) => Ok(Message {
                role: Role::Assistant,
                content: Arc::from(format!("the answer is {}", m.content)),
                tool_calls: vec![],
            }),
            Some(m) if m.content.as_ref() == "x" => Ok(Message {
                role: Role::Assistant,
                content: Arc::from("42"),
                tool_calls: vec![],
            }),
            _ => Ok(Message {
                role: Role::Assistant,
                content: Arc::from(""),
                tool_calls: vec![NativeToolCall {
                    id: "call_ask_b".to_string(),
                    name: "ask_b".to_string(),
                    arguments: serde_json::json!({ "prompt": "x" }),
                }],
            }),
        }
    }

    fn model_name(&self) -> &str {
        "content-aware"
    }
}

#[tokio::test]
async fn delegation_round_trip_restores_final_topic_and_pops_the_stack() {
    // A single agent router delegates "ask_b" back to its own entrypoint. This still exercises the
    // full push/pop frame discipline and `response_id` restoration without needing a second router
    // instance competing for the shared `chat.out` topic.
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let client = Arc::new(ContentAwareClient);
    let registry = registry_with_tools(&[]);
    let event_handler = Arc::new(LoggingEventHandler);

    let mut routes = HashMap::new();
    routes.insert(
        "ask_b".to_string(),
        ToolRoute::Delegation {
            sub_agent_entrypoint_topic: "agent.private.a".to_string(),
        },
    );

    let mut runner = NodeRunner::new(Arc::clone(&broker), RuntimeConfig::default(), event_handler.clone());
    runner.register_node(Arc::new(ChatNode::new(client, registry)) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::new(AgentRouterNode::new(
        "a",
        routes,
        Duration::from_secs(5),
        event_handler.clone(),
    )) as Arc<dyn NodeHandler>);
    let shutdown = runner.shutdown_handle();
    let handle = tokio::spawn(runner.run());

    send_user_prompt(&broker, "agent.public.a", "t-s4", "please ask b", "final.s4").await;
    let answer = wait_for_final(&broker, "final.s4").await;

    assert_eq!(answer.kind, EnvelopeKind::AiResponse);
    assert!(answer.delegation_stack.is_empty());
    assert!(
        answer
            .message_history
            .iter()
            .any(|m| m.content.as_ref() == "42"),
        "the delegated answer should have been folded into history as a tool-return"
    );
    assert_eq!(
        answer.latest_message.map(|m| m.text().to_string()),
        Some("the answer is 42".to_string())
    );

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn unknown_tool_short_circuits_without_ever_being_dispatched() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let client = scripted_client(
        vec![Reply::ToolCalls(vec![(
            "call_x",
            "nonexistent",
            serde_json::json!({}),
        )])],
        "fallback answer",
    );
    let registry = registry_with_tools(&[]);
    let event_handler = Arc::new(LoggingEventHandler);

    let mut runner = NodeRunner::new(Arc::clone(&broker), RuntimeConfig::default(), event_handler.clone());
    runner.register_node(Arc::new(ChatNode::new(client, registry)) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::new(AgentRouterNode::new(
        "chat",
        HashMap::new(),
        Duration::from_secs(5),
        event_handler.clone(),
    )) as Arc<dyn NodeHandler>);
    let shutdown = runner.shutdown_handle();

    // No tool node is registered for "nonexistent" — if the router tried to dispatch it there
    // would be nothing to answer, and this test would time out waiting for the final answer.
    let handle = tokio::spawn(runner.run());

    send_user_prompt(&broker, "agent.public.chat", "t-s6", "call a fake tool", "final.s6").await;
    let answer = wait_for_final(&broker, "final.s6").await;

    assert_eq!(
        answer.latest_message.map(|m| m.text().to_string()),
        Some("fallback answer".to_string())
    );
    let error_tool_message = answer
        .message_history
        .iter()
        .find(|m| matches!(m.role, Role::Tool { .. }))
        .expect("a synthesized error tool-return should be in history");
    assert!(error_tool_message.content.contains("no such tool"));

    shutdown.trigger();
    handle.await.unwrap();
}

/// Replies with a distinct update for each participant's first turn, then `SKIP` for every turn
/// after `skip_after` calls — drives a group chat through one non-skip round followed by a
/// unanimous-skip round so termination lands on a known dispatch count.
struct RoundRobinReplyClient {
    calls: AtomicUsize,
    skip_after: usize,
}

#[async_trait]
impl ClientWrapper for RoundRobinReplyClient {
    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
        _request_params: Option<&JsonValue>,
        _model_settings: Option<&JsonValue>,
    ) -> Result<Message, Box<dyn Error>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let text = if n < self.skip_after {
            format!("update {n}")
        } else {
            "SKIP".to_string()
        };
        Ok(Message {
            role: Role::Assistant,
            content: Arc::from(text.as_str()),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "round-robin"
    }
}

#[tokio::test]
async fn three_participant_groupchat_dispatches_exactly_six_turns_before_terminating() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let client = Arc::new(RoundRobinReplyClient {
        calls: AtomicUsize::new(0),
        skip_after: 3,
    });
    let registry = registry_with_tools(&[]);
    let event_handler = Arc::new(LoggingEventHandler);

    let mut runner = NodeRunner::new(Arc::clone(&broker), RuntimeConfig::default(), event_handler.clone());
    let chat_client: Arc<dyn ClientWrapper> = Arc::clone(&client) as Arc<dyn ClientWrapper>;
    runner.register_node(Arc::new(ChatNode::new(chat_client, registry)) as Arc<dyn NodeHandler>);
    for name in ["alice", "bob", "carol"] {
        runner.register_node(Arc::new(AgentRouterNode::new(
            name,
            HashMap::new(),
            Duration::from_secs(5),
            event_handler.clone(),
        )) as Arc<dyn NodeHandler>);
    }
    runner.register_node(Arc::new(GroupchatRouterNode::new(
        "standup",
        vec![
            "agent.private.alice".to_string(),
            "agent.private.bob".to_string(),
            "agent.private.carol".to_string(),
        ],
        Some("roster: alice, bob, carol".to_string()),
        event_handler.clone(),
    )) as Arc<dyn NodeHandler>);
    let shutdown = runner.shutdown_handle();
    let handle = tokio::spawn(runner.run());

    let mut envelope = EventEnvelope::new_user_prompt(
        "t-s5",
        Message {
            role: Role::User,
            content: Arc::from("kick things off"),
            tool_calls: vec![],
        },
    );
    envelope.final_response_topic = Some("final.s5".to_string());
    broker
        .publish(
            "groupchat.in.standup",
            serde_json::to_vec(&envelope).unwrap(),
            "t-s5",
        )
        .await
        .unwrap();

    let end = wait_for_final(&broker, "final.s5").await;
    assert_eq!(end.kind, EnvelopeKind::EndOfTurn);
    assert_eq!(
        client.calls.load(Ordering::SeqCst),
        6,
        "one full non-skip round followed by one unanimous-skip round is exactly 6 dispatches"
    );

    shutdown.trigger();
    handle.await.unwrap();
}
