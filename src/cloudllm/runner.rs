//! Node runner — drives registered [`NodeHandler`]s against a [`Broker`], with retrying publish
//! and cooperative shutdown.
//!
//! Grounded on `examples/original_source/calf/runner.py` (`Runner.start`/`_consume_loop`) for the
//! one-task-per-subscription consume loop and the retry-with-backoff publish wrapper, and on
//! `examples/CloudLLM-ai-cloudllm`'s existing `tokio::spawn` usage elsewhere in the donor for the
//! general shape of a long-running async task.

use crate::cloudllm::broker::{Broker, BrokerMessage};
use crate::cloudllm::config::RuntimeConfig;
use crate::cloudllm::envelope::EventEnvelope;
use crate::cloudllm::error::{BrokerError, OrchestrationError};
use crate::cloudllm::event::{EventHandler, RunnerEvent};
use crate::cloudllm::nodes::agent_router_node::AgentRouterNode;
use crate::cloudllm::nodes::NodeHandler;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Owns a broker and a set of node handlers, and drives them until shutdown.
///
/// Each node's `subscribe_topics()` gets its own consume loop running as a `tokio::spawn`ed task;
/// a node that subscribes to three topics (e.g. the agent router, which adds `chat.out` and one
/// `tool.out.{name}` per regular tool on top of its own wiring) gets three independent loops, each
/// delivering to the same `handle()` — matching the "shared state lives in the envelope, not the
/// node" design, since nothing keyed on which topic a call arrived from needs synchronizing.
pub struct NodeRunner {
    broker: Arc<dyn Broker>,
    config: RuntimeConfig,
    event_handler: Arc<dyn EventHandler>,
    nodes: Vec<Arc<dyn NodeHandler>>,
    sweepers: Vec<Arc<AgentRouterNode>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeRunner {
    pub fn new(broker: Arc<dyn Broker>, config: RuntimeConfig, event_handler: Arc<dyn EventHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            broker,
            config,
            event_handler,
            nodes: Vec::new(),
            sweepers: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn register_node(&mut self, node: Arc<dyn NodeHandler>) {
        self.nodes.push(node);
    }

    /// Register an agent router whose join buffer should be swept on
    /// [`RuntimeConfig::join_sweep_interval`]. A runner with no agent routers registers none.
    pub fn register_sweeper(&mut self, node: Arc<AgentRouterNode>) {
        self.sweepers.push(node);
    }

    /// A handle that, when triggered, requests cooperative shutdown without waiting for SIGINT.
    /// Kept separate from the `ctrl_c` listener so tests can shut a runner down deterministically.
    pub fn shutdown_handle(&self) -> NodeRunnerShutdown {
        NodeRunnerShutdown {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Spawn every consume loop and the join-sweep loop, then block until shutdown is requested
    /// (via `ctrl_c` or [`NodeRunnerShutdown::trigger`]) and every task has exited.
    pub async fn run(self) {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for node in &self.nodes {
            let subscribed = node.subscribe_topics();
            self.event_handler
                .on_runner_event(&RunnerEvent::NodeStarted {
                    node_name: Some(node.node_name().to_string()),
                    subscribed_topics: subscribed.clone(),
                })
                .await;
            for topic in subscribed {
                tasks.push(self.spawn_consume_loop(Arc::clone(node), topic));
            }
        }

        if !self.sweepers.is_empty() {
            tasks.push(self.spawn_sweep_loop());
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = shutdown_rx.recv() => {}
        }
        let _ = self.shutdown_tx.send(());
        self.event_handler
            .on_runner_event(&RunnerEvent::ShutdownRequested)
            .await;

        for task in tasks {
            let _ = task.await;
        }
        self.event_handler
            .on_runner_event(&RunnerEvent::ShutdownCompleted)
            .await;
    }

    fn spawn_consume_loop(&self, node: Arc<dyn NodeHandler>, topic: String) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let event_handler = Arc::clone(&self.event_handler);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut stream = broker.subscribe(&topic);
            loop {
                let message = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    message = stream.next() => message,
                };
                let Some(message) = message else { break };
                if let Err(err) =
                    handle_one_message(&node, &broker, &config, &event_handler, message).await
                {
                    log::warn!("node '{}' failed handling a message on '{topic}': {err}", node.node_name());
                }
            }
        })
    }

    fn spawn_sweep_loop(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let event_handler = Arc::clone(&self.event_handler);
        let config = self.config.clone();
        let sweepers = self.sweepers.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.join_sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                for sweeper in &sweepers {
                    for (topic, envelope) in sweeper.sweep_joins().await {
                        publish_envelope(&broker, &config, &event_handler, &topic, &envelope).await;
                    }
                }
            }
        })
    }
}

/// Cheap, cloneable handle for requesting shutdown of a running [`NodeRunner`] without going
/// through `ctrl_c`, e.g. from a test or from an admin endpoint outside this crate.
#[derive(Clone)]
pub struct NodeRunnerShutdown {
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeRunnerShutdown {
    pub fn trigger(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn handle_one_message(
    node: &Arc<dyn NodeHandler>,
    broker: &Arc<dyn Broker>,
    config: &RuntimeConfig,
    event_handler: &Arc<dyn EventHandler>,
    message: BrokerMessage,
) -> Result<(), OrchestrationError> {
    let envelope: EventEnvelope = serde_json::from_slice(&message.payload).map_err(BrokerError::from)?;
    let outputs = node.handle(envelope).await?;
    for (topic, out_envelope) in outputs {
        publish_envelope(broker, config, event_handler, &topic, &out_envelope).await;
    }
    Ok(())
}

/// Publish one envelope with bounded exponential backoff, matching `RuntimeConfig`'s
/// `publish_max_retries`/`publish_retry_base_delay`. Gives up and emits
/// [`RunnerEvent::PublishAbandoned`] rather than blocking the consume loop forever — under
/// at-least-once delivery the upstream node will eventually redeliver the triggering message.
async fn publish_envelope(
    broker: &Arc<dyn Broker>,
    config: &RuntimeConfig,
    event_handler: &Arc<dyn EventHandler>,
    topic: &str,
    envelope: &EventEnvelope,
) {
    let payload = match serde_json::to_vec(envelope) {
        Ok(payload) => payload,
        Err(err) => {
            log::error!("failed to encode envelope for '{topic}': {err}");
            return;
        }
    };
    let trace_id = envelope.trace_id.clone();

    let mut attempt = 0;
    loop {
        match broker.publish(topic, payload.clone(), &trace_id).await {
            Ok(()) => return,
            Err(err) => {
                attempt += 1;
                if attempt > config.publish_max_retries {
                    event_handler
                        .on_runner_event(&RunnerEvent::PublishAbandoned {
                            topic: topic.to_string(),
                            attempts: attempt,
                        })
                        .await;
                    return;
                }
                event_handler
                    .on_runner_event(&RunnerEvent::PublishRetrying {
                        topic: topic.to_string(),
                        attempt,
                        error: err.to_string(),
                    })
                    .await;
                let delay = config.publish_retry_base_delay * 2u32.pow((attempt - 1) as u32);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{Message, Role};
    use crate::cloudllm::envelope::EnvelopeKind;
    use crate::cloudllm::event::LoggingEventHandler;
    use crate::cloudllm::broker::InMemoryBroker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoNode {
        received: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeHandler for EchoNode {
        fn subscribe_topics(&self) -> Vec<String> {
            vec!["echo.in".to_string()]
        }

        fn node_name(&self) -> &str {
            "echo"
        }

        async fn handle(
            &self,
            envelope: EventEnvelope,
        ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(vec![("echo.out".to_string(), envelope)])
        }
    }

    #[tokio::test]
    async fn consume_loop_delivers_published_messages_to_the_node() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
        let received = Arc::new(AtomicUsize::new(0));
        let mut runner = NodeRunner::new(
            Arc::clone(&broker),
            RuntimeConfig::default(),
            Arc::new(LoggingEventHandler),
        );
        runner.register_node(Arc::new(EchoNode {
            received: Arc::clone(&received),
        }));
        let shutdown = runner.shutdown_handle();
        let mut downstream = broker.subscribe("echo.out");

        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let envelope = EventEnvelope::new_user_prompt(
            "trace-runner-1",
            Message {
                role: Role::User,
                content: std::sync::Arc::from("hi"),
                tool_calls: vec![],
            },
        );
        broker
            .publish(
                "echo.in",
                serde_json::to_vec(&envelope).unwrap(),
                "trace-runner-1",
            )
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), downstream.next())
            .await
            .expect("echo.out should receive a message")
            .expect("stream should yield one message");
        let echoed: EventEnvelope = serde_json::from_slice(&delivered.payload).unwrap();
        assert_eq!(echoed.kind, EnvelopeKind::UserPrompt);
        assert_eq!(received.load(Ordering::SeqCst), 1);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runner should shut down promptly")
            .unwrap();
    }
}
