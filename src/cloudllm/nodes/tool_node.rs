//! Tool node — executes one tool call and publishes exactly one `tool_result` in response.
//!
//! Grounded on `src/cloudllm/tool_protocol.rs` (`ToolRegistry::execute_tool`) for execution, and on
//! the `tool.in.{tool}` / `tool.out.{tool}` contract for wiring.

use crate::cloudllm::envelope::{EnvelopeKind, EventEnvelope, LatestMessage, ToolReturnPart};
use crate::cloudllm::error::{EnvelopeError, OrchestrationError, ToolError};
use crate::cloudllm::nodes::NodeHandler;
use crate::cloudllm::tool_protocol::ToolRegistry;
use crate::cloudllm::topic::{resolve_template, templates, NodeWiring, Registerable};
use async_trait::async_trait;
use std::sync::Arc;

/// One tool node per registered tool, named after the tool it executes.
pub struct ToolNode {
    tool_name: String,
    registry: Arc<ToolRegistry>,
}

impl ToolNode {
    pub fn new(tool_name: impl Into<String>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            tool_name: tool_name.into(),
            registry,
        }
    }
}

impl Registerable for ToolNode {
    fn name(&self) -> Option<&str> {
        Some(&self.tool_name)
    }

    fn wiring(&self) -> NodeWiring {
        NodeWiring {
            entrypoint_topic: Some(resolve_template(templates::TOOL_IN, &self.tool_name)),
            publish_topic: Some(resolve_template(templates::TOOL_OUT, &self.tool_name)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl NodeHandler for ToolNode {
    fn subscribe_topics(&self) -> Vec<String> {
        self.wiring().subscribe_topics()
    }

    fn node_name(&self) -> &str {
        &self.tool_name
    }

    async fn handle(
        &self,
        envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        if envelope.kind != EnvelopeKind::ToolCallRequest {
            return Err(EnvelopeError::UnknownKind(format!("{:?}", envelope.kind)).into());
        }
        let call = envelope
            .latest_message
            .as_ref()
            .and_then(LatestMessage::as_tool_call)
            .ok_or(EnvelopeError::MissingLatestMessage)?
            .clone();

        if call.tool_name != self.tool_name {
            return Err(ToolError::MismatchedToolCall {
                expected: self.tool_name.clone(),
                actual: call.tool_name,
            }
            .into());
        }

        let outcome = self
            .registry
            .execute_tool(&self.tool_name, call.arguments.clone())
            .await;

        let tool_return = match outcome {
            Ok(result) if result.success => ToolReturnPart {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: self.tool_name.clone(),
                content: result.output.to_string(),
                is_error: false,
            },
            Ok(result) => ToolReturnPart {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: self.tool_name.clone(),
                content: result.error.unwrap_or_else(|| "tool reported failure".to_string()),
                is_error: true,
            },
            Err(err) => ToolReturnPart {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: self.tool_name.clone(),
                content: err.to_string(),
                is_error: true,
            },
        };

        let out = envelope.derive(
            EnvelopeKind::ToolResult,
            Some(LatestMessage::ToolReturn(tool_return)),
        );
        let publish_topic = self
            .wiring()
            .publish_topic
            .expect("tool node always publishes to tool.out.{name}");
        Ok(vec![(publish_topic, out)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::envelope::ToolCallPart;
    use crate::cloudllm::tool_protocol::{
        ToolMetadata, ToolProtocol, ToolResult as ProtoToolResult,
    };
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use std::error::Error;

    struct EchoProtocol;

    #[async_trait]
    impl ToolProtocol for EchoProtocol {
        async fn execute(
            &self,
            tool_name: &str,
            parameters: JsonValue,
        ) -> Result<ProtoToolResult, Box<dyn Error + Send + Sync>> {
            if tool_name == "boom" {
                return Ok(ProtoToolResult::failure("deliberately broken".to_string()));
            }
            Ok(ProtoToolResult::success(parameters))
        }

        async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
            Ok(vec![])
        }

        async fn get_tool_metadata(
            &self,
            tool_name: &str,
        ) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
            Ok(ToolMetadata::new(tool_name, "echoes its input"))
        }

        fn protocol_name(&self) -> &str {
            "echo"
        }
    }

    fn envelope_with_call(tool_name: &str, tool_call_id: &str) -> EventEnvelope {
        let mut envelope = EventEnvelope::new(EnvelopeKind::ToolCallRequest, "trace-1");
        envelope.latest_message = Some(LatestMessage::ToolCall(ToolCallPart {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments: serde_json::json!({"x": 1}),
        }));
        envelope.response_id = Some("resp-1".to_string());
        envelope
    }

    fn registry_with(tool_name: &str) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new(Arc::new(EchoProtocol));
        registry.add_tool(crate::cloudllm::tool_protocol::Tool::new(
            tool_name,
            "a test tool",
            Arc::new(EchoProtocol),
        ));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn successful_execution_publishes_tool_result() {
        let node = ToolNode::new("echo", registry_with("echo"));
        let envelope = envelope_with_call("echo", "call_1");
        let mut out = node.handle(envelope).await.unwrap();
        let (topic, envelope) = out.remove(0);
        assert_eq!(topic, "tool.out.echo");
        assert_eq!(envelope.kind, EnvelopeKind::ToolResult);
        assert_eq!(envelope.response_id.as_deref(), Some("resp-1"));
        match envelope.latest_message {
            Some(LatestMessage::ToolReturn(ret)) => {
                assert_eq!(ret.tool_call_id, "call_1");
                assert!(!ret.is_error);
            }
            other => panic!("unexpected latest_message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mismatched_tool_name_is_rejected() {
        let node = ToolNode::new("echo", registry_with("echo"));
        let envelope = envelope_with_call("other_tool", "call_1");
        let result = node.handle(envelope).await;
        assert!(matches!(
            result,
            Err(OrchestrationError::Tool(ToolError::MismatchedToolCall { .. }))
        ));
    }

    #[tokio::test]
    async fn failed_tool_execution_still_publishes_exactly_one_error_result() {
        let node = ToolNode::new("boom", registry_with("boom"));
        let envelope = envelope_with_call("boom", "call_1");
        let mut out = node.handle(envelope).await.unwrap();
        assert_eq!(out.len(), 1);
        let (_, envelope) = out.remove(0);
        match envelope.latest_message {
            Some(LatestMessage::ToolReturn(ret)) => assert!(ret.is_error),
            other => panic!("unexpected latest_message: {other:?}"),
        }
    }
}
