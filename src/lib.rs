// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// If you want to provide direct access (without having to navigate through the whole hierarchy) to certain types or functionalities at the crate level, you can use re-exports:

// Re-exporting key items for easier external access.
pub use cloudllm::client_wrapper::{ClientWrapper, Message, Role};

pub use cloudllm::broker::{Broker, InMemoryBroker, NetworkedBroker};
pub use cloudllm::config::{BrokerMode, RuntimeConfig};
pub use cloudllm::envelope::{EnvelopeKind, EventEnvelope, LatestMessage, ToolCallPart, ToolReturnPart};
pub use cloudllm::error::OrchestrationError;
pub use cloudllm::event::{EventHandler, LoggingEventHandler, RouterEvent, RunnerEvent};
pub use cloudllm::nodes::agent_router_node::{AgentRouterNode, ToolRoute};
pub use cloudllm::nodes::chat_node::ChatNode;
pub use cloudllm::nodes::groupchat_router_node::GroupchatRouterNode;
pub use cloudllm::nodes::tool_node::ToolNode;
pub use cloudllm::nodes::NodeHandler;
pub use cloudllm::runner::{NodeRunner, NodeRunnerShutdown};
// If you wish, you can also re-export specific clients or functionalities from the `clients` submodule:
// pub use cloudllm::clients::openai;
