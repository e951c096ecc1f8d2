//! CLI entry point: wires a single-agent chat/tool/agent-router topology over an in-memory
//! broker, reads one prompt from the command line, and prints the final response.
//!
//! Publishes one `user_prompt` envelope into the routed topology and waits on its
//! `final_response_topic`, rather than driving the conversation through a direct in-process loop.

use cloudllm::cloudllm::broker::InMemoryBroker;
use cloudllm::cloudllm::client_wrapper::{Message, Role};
use cloudllm::cloudllm::clients::openai::{Model, OpenAIClient};
use cloudllm::cloudllm::config::RuntimeConfig;
use cloudllm::cloudllm::envelope::EventEnvelope;
use cloudllm::cloudllm::event::LoggingEventHandler;
use cloudllm::cloudllm::nodes::agent_router_node::{AgentRouterNode, ToolRoute};
use cloudllm::cloudllm::nodes::chat_node::ChatNode;
use cloudllm::cloudllm::nodes::tool_node::ToolNode;
use cloudllm::cloudllm::nodes::NodeHandler;
use cloudllm::cloudllm::runner::NodeRunner;
use cloudllm::cloudllm::tool_protocol::{ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolResult};
use cloudllm::cloudllm::tool_protocols::CustomToolProtocol;
use cloudllm::cloudllm::tools::Calculator;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "What is 12 * 7?".to_string());
    let secret_key = std::env::var("OPEN_AI_SECRET")?;

    let client = Arc::new(OpenAIClient::new_with_model_enum(&secret_key, Model::GPT41Nano));
    let registry = Arc::new(build_tool_registry().await?);
    let event_handler = Arc::new(LoggingEventHandler);
    let broker: Arc<dyn cloudllm::cloudllm::broker::Broker> = Arc::new(InMemoryBroker::default());

    let chat_node = Arc::new(ChatNode::new(client, Arc::clone(&registry)));

    let mut routes = HashMap::new();
    routes.insert("calculator".to_string(), ToolRoute::Regular);
    let agent_router = Arc::new(AgentRouterNode::new(
        "main",
        routes,
        Duration::from_secs(30),
        Arc::clone(&event_handler) as Arc<dyn cloudllm::cloudllm::event::EventHandler>,
    ));
    let calculator_node = Arc::new(ToolNode::new("calculator", registry));

    let mut runner = NodeRunner::new(
        Arc::clone(&broker),
        RuntimeConfig::default(),
        Arc::clone(&event_handler) as Arc<dyn cloudllm::cloudllm::event::EventHandler>,
    );
    runner.register_node(Arc::clone(&chat_node) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::clone(&agent_router) as Arc<dyn NodeHandler>);
    runner.register_node(Arc::clone(&calculator_node) as Arc<dyn NodeHandler>);
    runner.register_sweeper(Arc::clone(&agent_router));
    let shutdown = runner.shutdown_handle();

    let mut final_response = broker.subscribe("cli.final");
    let runner_task = tokio::spawn(runner.run());

    let mut envelope = EventEnvelope::new_user_prompt(
        uuid::Uuid::new_v4().to_string(),
        Message {
            role: Role::User,
            content: Arc::from(prompt.as_str()),
            tool_calls: vec![],
        },
    );
    envelope.final_response_topic = Some("cli.final".to_string());
    broker
        .publish(
            "agent.public.main",
            serde_json::to_vec(&envelope)?,
            &envelope.trace_id,
        )
        .await?;

    match tokio::time::timeout(Duration::from_secs(60), final_response.next()).await {
        Ok(Some(message)) => {
            let answer: EventEnvelope = serde_json::from_slice(&message.payload)?;
            let text = answer
                .latest_message
                .map(|m| m.text().to_string())
                .unwrap_or_default();
            println!("{text}");
        }
        Ok(None) => eprintln!("broker closed before a final response arrived"),
        Err(_) => eprintln!("timed out waiting for a final response"),
    }

    shutdown.trigger();
    runner_task.await?;
    Ok(())
}

async fn build_tool_registry() -> Result<ToolRegistry, Box<dyn std::error::Error + Send + Sync>> {
    let protocol = Arc::new(CustomToolProtocol::new());
    let calculator = Calculator::new();
    protocol
        .register_async_tool(
            ToolMetadata::new("calculator", "Evaluates a scientific calculator expression").with_parameter(
                ToolParameter::new("expression", ToolParameterType::String).required(),
            ),
            Arc::new(move |params| {
                let calculator = calculator.clone();
                Box::pin(async move {
                    let expression = params
                        .get("expression")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    match calculator.evaluate(&expression).await {
                        Ok(value) => Ok(ToolResult::success(serde_json::json!({ "result": value }))),
                        Err(err) => Ok(ToolResult::failure(err.to_string())),
                    }
                })
            }),
        )
        .await;

    let mut registry = ToolRegistry::new(protocol);
    registry.discover_tools_from_primary().await?;
    Ok(registry)
}
