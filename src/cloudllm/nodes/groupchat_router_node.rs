//! Group-chat router node — round-robin scheduler over a fixed roster of agent routers, with
//! unanimous-skip termination.
//!
//! Grounded directly on `examples/original_source/calfkit/nodes/groupchat_router_node.py`
//! (`GroupchatNode._route_groupchat`/`_call_agent`): commit turn, flatten queue, pick
//! `turn_index % N`, publish with `final_response_topic` set to the group returnpoint, check for
//! unanimous skip.

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::cloudllm::envelope::{EnvelopeKind, EventEnvelope, LatestMessage};
use crate::cloudllm::error::{EnvelopeError, OrchestrationError};
use crate::cloudllm::event::{EventHandler, RouterEvent};
use crate::cloudllm::groupchat::GroupchatData;
use crate::cloudllm::nodes::NodeHandler;
use crate::cloudllm::topic::{resolve_template, templates, NodeWiring, Registerable};
use async_trait::async_trait;
use std::sync::Arc;

/// Whole-string, trimmed, case-insensitive match — not a substring search (see the resolved
/// open question this is grounded on: a substring match would misfire on a response that merely
/// mentions the word "skip" in passing).
const SKIP_SENTINEL: &str = "SKIP";

pub struct GroupchatRouterNode {
    name: String,
    wiring: NodeWiring,
    agent_topics: Vec<String>,
    system_prompt_addition: Option<String>,
    event_handler: Arc<dyn EventHandler>,
}

impl GroupchatRouterNode {
    pub fn new(
        name: impl Into<String>,
        agent_topics: Vec<String>,
        system_prompt_addition: Option<String>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        let name = name.into();
        let wiring = NodeWiring {
            entrypoint_topic: Some(resolve_template(templates::GROUPCHAT_IN, &name)),
            returnpoint_topic: Some(resolve_template(templates::GROUPCHAT_RETURN, &name)),
            shared_subscribe_topic: None,
            publish_topic: None,
        };
        Self {
            name,
            wiring,
            agent_topics,
            system_prompt_addition,
            event_handler,
        }
    }

    /// Steps 1-6 of the per-turn algorithm: commit the previous uncommitted turn, flatten the
    /// turn window, pick the next participant, and publish to it.
    async fn run_next_turn(
        &self,
        mut envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        let (history, participant_topic, turn_index) = {
            let data = envelope
                .groupchat_data
                .as_mut()
                .ok_or(EnvelopeError::MissingLatestMessage)?;
            data.increment_turn_index();
            data.commit_turn();
            (
                data.flat_messages_from_turns_queue(),
                data.current_participant_topic().map(str::to_string),
                data.turn_index,
            )
        };

        let Some(participant_topic) = participant_topic else {
            return Ok(vec![]);
        };

        self.event_handler
            .on_router_event(&RouterEvent::GroupchatTurnCommitted {
                trace_id: envelope.trace_id.clone(),
                turn_index,
                participant_topic: participant_topic.clone(),
                skipped: false,
            })
            .await;

        let prompt_text = self.system_prompt_addition.clone().unwrap_or_default();
        let mut outgoing = envelope.derive(
            EnvelopeKind::UserPrompt,
            Some(LatestMessage::UserInput(Message {
                role: Role::User,
                content: Arc::from(prompt_text.as_str()),
                tool_calls: vec![],
            })),
        );
        outgoing.message_history = history;
        outgoing.final_response_topic = self.wiring.returnpoint_topic.clone();
        Ok(vec![(participant_topic, outgoing)])
    }

    /// "On return from participant" steps 1-3: skip check, commit contribution, unanimous-skip
    /// termination check.
    async fn handle_participant_return(
        &self,
        mut envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        let text = envelope
            .latest_message
            .as_ref()
            .map(|m| m.text().to_string())
            .unwrap_or_default();
        let is_skip = text.trim().eq_ignore_ascii_case(SKIP_SENTINEL);

        let (terminated, participant_count, origin_topic) = {
            let data = envelope
                .groupchat_data
                .as_mut()
                .ok_or(EnvelopeError::MissingLatestMessage)?;
            if is_skip {
                data.uncommitted_turn.skipped = true;
            } else {
                data.uncommitted_turn.add_message(Message {
                    role: Role::Assistant,
                    content: Arc::from(text.as_str()),
                    tool_calls: vec![],
                });
            }
            data.record_skip(is_skip);
            (
                data.is_all_skipped(),
                data.participant_count(),
                data.origin_final_response_topic.clone(),
            )
        };

        if terminated {
            self.event_handler
                .on_router_event(&RouterEvent::GroupchatTerminated {
                    trace_id: envelope.trace_id.clone(),
                    participant_count,
                })
                .await;
            let out = envelope.derive(EnvelopeKind::EndOfTurn, None);
            return Ok(match origin_topic {
                Some(topic) => vec![(topic, out)],
                None => vec![],
            });
        }

        self.run_next_turn(envelope).await
    }
}

impl Registerable for GroupchatRouterNode {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn wiring(&self) -> NodeWiring {
        self.wiring.clone()
    }
}

#[async_trait]
impl NodeHandler for GroupchatRouterNode {
    fn subscribe_topics(&self) -> Vec<String> {
        self.wiring.subscribe_topics()
    }

    fn node_name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        mut envelope: EventEnvelope,
    ) -> Result<Vec<(String, EventEnvelope)>, OrchestrationError> {
        match envelope.kind {
            EnvelopeKind::UserPrompt => {
                if envelope.groupchat_data.is_none() {
                    let mut data = GroupchatData::with_origin(
                        self.agent_topics.clone(),
                        self.system_prompt_addition.clone(),
                        envelope.final_response_topic.clone(),
                    );
                    if let Some(LatestMessage::UserInput(message)) = &envelope.latest_message {
                        data.uncommitted_turn.add_message(message.clone());
                    }
                    envelope.groupchat_data = Some(data);
                }
                self.run_next_turn(envelope).await
            }
            EnvelopeKind::AiResponse => self.handle_participant_return(envelope).await,
            EnvelopeKind::EndOfTurn => Ok(vec![]),
            other => Err(EnvelopeError::UnknownKind(format!("{other:?} at groupchat router")).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::event::LoggingEventHandler;

    fn node(agent_topics: Vec<String>) -> GroupchatRouterNode {
        GroupchatRouterNode::new(
            "standup",
            agent_topics,
            Some("roster: alice, bob".to_string()),
            Arc::new(LoggingEventHandler),
        )
    }

    #[tokio::test]
    async fn first_turn_picks_the_first_participant() {
        let node = node(vec!["agent.private.alice".into(), "agent.private.bob".into()]);
        let envelope = EventEnvelope::new_user_prompt(
            "trace-gc-1",
            Message {
                role: Role::User,
                content: Arc::from("kick things off"),
                tool_calls: vec![],
            },
        );
        let mut out = node.handle(envelope).await.unwrap();
        assert_eq!(out.len(), 1);
        let (topic, envelope) = out.remove(0);
        assert_eq!(topic, "agent.private.alice");
        assert_eq!(
            envelope.final_response_topic.as_deref(),
            Some("groupchat.return.standup")
        );
        assert_eq!(envelope.groupchat_data.unwrap().turn_index, 0);
    }

    #[tokio::test]
    async fn unanimous_skip_terminates_and_emits_end_of_turn() {
        let node = node(vec!["agent.private.alice".into(), "agent.private.bob".into()]);
        let envelope = EventEnvelope::new_user_prompt(
            "trace-gc-2",
            Message {
                role: Role::User,
                content: Arc::from("kick things off"),
                tool_calls: vec![],
            },
        );
        let mut out = node.handle(envelope).await.unwrap();
        let (_, mut envelope) = out.remove(0);

        // alice skips
        envelope.kind = EnvelopeKind::AiResponse;
        envelope.latest_message = Some(LatestMessage::ModelResponse {
            message: Message {
                role: Role::Assistant,
                content: Arc::from("SKIP"),
                tool_calls: vec![],
            },
            tool_calls: vec![],
        });
        let mut out = node.handle(envelope).await.unwrap();
        let (_, mut envelope) = out.remove(0);

        // bob skips too -> unanimous
        envelope.kind = EnvelopeKind::AiResponse;
        envelope.latest_message = Some(LatestMessage::ModelResponse {
            message: Message {
                role: Role::Assistant,
                content: Arc::from("  skip  "),
                tool_calls: vec![],
            },
            tool_calls: vec![],
        });
        let out = node.handle(envelope).await.unwrap();
        // No final_response_topic was set on the synthetic test envelope, so termination drops.
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn non_skip_response_is_appended_and_chat_continues() {
        let node = node(vec!["agent.private.alice".into(), "agent.private.bob".into()]);
        let envelope = EventEnvelope::new_user_prompt(
            "trace-gc-3",
            Message {
                role: Role::User,
                content: Arc::from("kick things off"),
                tool_calls: vec![],
            },
        );
        let mut out = node.handle(envelope).await.unwrap();
        let (_, mut envelope) = out.remove(0);

        envelope.kind = EnvelopeKind::AiResponse;
        envelope.latest_message = Some(LatestMessage::ModelResponse {
            message: Message {
                role: Role::Assistant,
                content: Arc::from("here's my update"),
                tool_calls: vec![],
            },
            tool_calls: vec![],
        });
        let mut out = node.handle(envelope).await.unwrap();
        assert_eq!(out.len(), 1);
        let (topic, envelope) = out.remove(0);
        assert_eq!(topic, "agent.private.bob");
        assert_eq!(envelope.groupchat_data.unwrap().consecutive_skips, 0);
    }
}
