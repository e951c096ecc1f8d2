//! Chat node — the single point of contact with the LLM client.
//!
//! Grounded on `examples/original_source/calf/nodes/chat_node.py`'s `ChatNode.on_enter` for the
//! control flow, and on [`ClientWrapper::send_message`] for the concrete call contract.

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
use crate::cloudllm::envelope::{EnvelopeKind, EventEnvelope, LatestMessage, ToolCallPart};
use crate::cloudllm::error::{EnvelopeError, OrchestrationError};
use crate::cloudllm::nodes::NodeHandler;
use crate::cloudllm::tool_protocol::{ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry};
use crate::cloudllm::topic::{templates, NodeWiring, Registerable};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use uuid::Uuid;

/// Converts a registry's [`ToolMetadata`] into the [`ToolDefinition`]s `send_message` forwards to
/// the provider. The donor's own doc comment points at a `ToolMetadata::to_tool_definition` helper
/// that was never actually added to `tool_protocol.rs`, so this lives here instead.
fn tool_definition_from_metadata(meta: &ToolMetadata) -> ToolDefinition {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in &meta.parameters {
        properties.insert(param.name.clone(), json_schema_for_parameter(param));
        if param.required {
            required.push(JsonValue::String(param.name.clone()));
        }
    }
    ToolDefinition {
        name: meta.name.clone(),
        description: meta.description.clone(),
        parameters_schema: JsonValue::Object(
            [
                ("type".to_string(), JsonValue::String("object".to_string())),
                ("properties".to_string(), JsonValue::Object(properties)),
                ("required".to_string(), JsonValue::Array(required)),
            ]
            .into_iter()
            .collect(),
        ),
    }
}

fn json_schema_for_parameter(param: &ToolParameter) -> JsonValue {
    let mut schema = Map::new();
    schema.insert(
        "type".to_string(),
        JsonValue::String(schema_type_name(&param.param_type).to_string()),
    );
    if let Some(description) = &param.description {
        schema.insert("description".to_string(), JsonValue::String(description.clone()));
    }
    if let Some(items) = &param.items {
        schema.insert(
            "items".to_string(),
            JsonValue::Object(
                [(
                    "type".to_string(),
                    JsonValue::String(schema_type_name(items).to_string()),
                )]
                .into_iter()
                .collect(),
            ),
        );
    }
    if let Some(properties) = &param.properties {
        let nested: Map<String, JsonValue> = properties
            .iter()
            .map(|(name, param)| (name.clone(), json_schema_for_parameter(param)))
            .collect();
        schema.insert("properties".to_string(), JsonValue::Object(nested));
    }
    JsonValue::Object(schema)
}

fn schema_type_name(param_type: &ToolParameterType) -> &'static str {
    match param_type {
        ToolParameterType::String => "string",
        ToolParameterType::Number => "number",
        ToolParameterType::Integer => "integer",
        ToolParameterType::Boolean => "boolean",
        ToolParameterType::Array => "array",
        ToolParameterType::Object => "object",
    }
}

/// The single chat node shared by every agent in a deployment — stateless aside from its client
/// and tool registry, keyed only by `chat.in`/`chat.out`, never by agent name.
pub struct ChatNode {
    client: Arc<dyn ClientWrapper>,
    tools: Arc<ToolRegistry>,
    /// Per-turn model request params applied when an inbound envelope doesn't carry its own
    /// `patch_model_request_params` override.
    default_request_params: Option<JsonValue>,
}

impl ChatNode {
    pub fn new(client: Arc<dyn ClientWrapper>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            client,
            tools,
            default_request_params: None,
        }
    }

    pub fn with_default_request_params(mut self, params: JsonValue) -> Self {
        self.default_request_params = Some(params);
        self
    }

    fn tool_definitions(&self) -> Option<Vec<ToolDefinition>> {
        let metadata = self.tools.list_tools();
        if metadata.is_empty() {
            return None;
        }
        Some(metadata.into_iter().map(tool_definition_from_metadata).collect())
    }
}

impl Registerable for ChatNode {
    fn name(&self) -> Option<&str> {
        None
    }

    fn wiring(&self) -> NodeWiring {
        NodeWiring {
            shared_subscribe_topic: Some(templates::CHAT_IN.to_string()),
            publish_topic: Some(templates::CHAT_OUT.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl NodeHandler for ChatNode {
    fn subscribe_topics(&self) -> Vec<String> {
        self.wiring().subscribe_topics()
    }

    fn node_name(&self) -> &str {
        "chat"
    }

    async fn handle(
        &self,
        envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        if envelope.latest_message.is_none() {
            return Err(EnvelopeError::MissingLatestMessage.into());
        }

        let request_params = envelope
            .patch_model_request_params
            .clone()
            .or_else(|| self.default_request_params.clone());
        let model_settings = envelope.patch_model_settings.clone();

        let response = self
            .client
            .send_message(
                &envelope.message_history,
                self.tool_definitions(),
                request_params.as_ref(),
                model_settings.as_ref(),
            )
            .await;

        let latest_message = match response {
            Ok(message) => {
                let tool_calls = message
                    .tool_calls
                    .iter()
                    .map(|call| ToolCallPart {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .collect();
                LatestMessage::ModelResponse { message, tool_calls }
            }
            Err(err) => LatestMessage::ModelResponse {
                message: Message {
                    role: Role::Assistant,
                    content: Arc::from(format!("model call failed: {err}").as_str()),
                    tool_calls: vec![],
                },
                tool_calls: vec![],
            },
        };

        let mut out = envelope.derive(EnvelopeKind::AiResponse, Some(latest_message));
        out.response_id = Some(Uuid::new_v4().to_string());

        let publish_topic = self
            .wiring()
            .publish_topic
            .expect("chat node always publishes to chat.out");
        Ok(vec![(publish_topic, out)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::NativeToolCall;
    use crate::cloudllm::tool_protocol::{Tool, ToolError, ToolProtocol, ToolResult as ProtoToolResult};
    use async_trait::async_trait;
    use std::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClient {
        reply: String,
        tool_calls: Vec<NativeToolCall>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClientWrapper for StubClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
            _request_params: Option<&JsonValue>,
            _model_settings: Option<&JsonValue>,
        ) -> Result<Message, Box<dyn Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("provider unavailable".into());
            }
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(self.reply.as_str()),
                tool_calls: self.tool_calls.clone(),
            })
        }

        fn model_name(&self) -> &str {
            "stub-model"
        }
    }

    struct NoopProtocol;

    #[async_trait]
    impl ToolProtocol for NoopProtocol {
        async fn execute(
            &self,
            _tool_name: &str,
            _parameters: JsonValue,
        ) -> Result<ProtoToolResult, Box<dyn Error + Send + Sync>> {
            Err(Box::new(ToolError::NotFound("noop".into())))
        }

        async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
            Ok(vec![])
        }

        async fn get_tool_metadata(
            &self,
            tool_name: &str,
        ) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
            Err(Box::new(ToolError::NotFound(tool_name.to_string())))
        }

        fn protocol_name(&self) -> &str {
            "noop"
        }
    }

    fn user_prompt_envelope(text: &str) -> EventEnvelope {
        let mut envelope = EventEnvelope::new_user_prompt(
            "trace-1",
            Message {
                role: Role::User,
                content: Arc::from(text),
                tool_calls: vec![],
            },
        );
        envelope.push_latest_into_history();
        envelope
    }

    #[tokio::test]
    async fn successful_reply_becomes_ai_response_with_fresh_response_id() {
        let client = Arc::new(StubClient {
            reply: "hi there".into(),
            tool_calls: vec![],
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ToolRegistry::new(Arc::new(NoopProtocol)));
        let node = ChatNode::new(client, registry);

        let envelope = user_prompt_envelope("hello");
        let mut out = node.handle(envelope).await.unwrap();
        assert_eq!(out.len(), 1);
        let (topic, envelope) = out.remove(0);
        assert_eq!(topic, "chat.out");
        assert_eq!(envelope.kind, EnvelopeKind::AiResponse);
        assert!(envelope.response_id.is_some());
        match envelope.latest_message {
            Some(LatestMessage::ModelResponse { message, tool_calls }) => {
                assert_eq!(message.content.as_ref(), "hi there");
                assert!(tool_calls.is_empty());
            }
            other => panic!("unexpected latest_message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_calls_become_tool_call_parts() {
        let client = Arc::new(StubClient {
            reply: "".into(),
            tool_calls: vec![NativeToolCall {
                id: "call_1".into(),
                name: "calculator".into(),
                arguments: serde_json::json!({"expression": "1+1"}),
            }],
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ToolRegistry::new(Arc::new(NoopProtocol)));
        let node = ChatNode::new(client, registry);

        let envelope = user_prompt_envelope("what is 1+1?");
        let mut out = node.handle(envelope).await.unwrap();
        let (_, envelope) = out.remove(0);
        let calls = envelope.latest_message.unwrap().tool_calls().to_vec();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "calculator");
    }

    #[tokio::test]
    async fn missing_latest_message_is_rejected() {
        let client = Arc::new(StubClient {
            reply: "".into(),
            tool_calls: vec![],
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ToolRegistry::new(Arc::new(NoopProtocol)));
        let node = ChatNode::new(client, registry);
        let envelope = EventEnvelope::new(EnvelopeKind::ToolResult, "trace-2");
        let result = node.handle(envelope).await;
        assert!(matches!(
            result,
            Err(OrchestrationError::Envelope(EnvelopeError::MissingLatestMessage))
        ));
    }

    #[tokio::test]
    async fn provider_failure_becomes_an_error_ai_response_not_an_err() {
        let client = Arc::new(StubClient {
            reply: "".into(),
            tool_calls: vec![],
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ToolRegistry::new(Arc::new(NoopProtocol)));
        let node = ChatNode::new(client, registry);
        let envelope = user_prompt_envelope("hello");
        let mut out = node.handle(envelope).await.unwrap();
        let (_, envelope) = out.remove(0);
        assert_eq!(envelope.kind, EnvelopeKind::AiResponse);
        let text = envelope.latest_message.unwrap().text().to_string();
        assert!(text.contains("model call failed"));
    }
}
