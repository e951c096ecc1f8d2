//! Group-chat sub-state carried inside an [`EventEnvelope`](crate::envelope::EventEnvelope).
//!
//! Lives entirely inside the envelope rather than in node-local state, so group chats scale
//! horizontally across router replicas keyed by `trace_id` — any replica that picks up the next
//! envelope has everything it needs to continue the chat.

use crate::cloudllm::client_wrapper::Message;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One participant's contribution to a group-chat round: either a list of messages, or a skip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Turn {
    pub messages: Vec<Message>,
    pub skipped: bool,
}

impl Turn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip() -> Self {
        Self {
            messages: Vec::new(),
            skipped: true,
        }
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// A FIFO queue bounded at a fixed capacity; pushing past capacity evicts the oldest element.
///
/// Grounds the group-chat turn window: capacity is always `N - 1` for an `N`-participant chat (see
/// [`GroupchatData::new`]), so every participant sees a sliding window of what the other `N - 1`
/// participants most recently said.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundedQueue<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Push `item`, evicting the oldest element first if already at capacity.
    ///
    /// A `capacity` of zero means every push evicts immediately, i.e. the queue never retains
    /// anything — the correct behavior for a two-participant chat (`N - 1 = 1`... note a
    /// single-participant chat has `N - 1 = 0`).
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }
}

/// Group-chat sub-state: roster, turn counter, skip counter, and the bounded turn-history window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupchatData {
    pub agent_topics: Vec<String>,
    pub turn_index: i64,
    pub consecutive_skips: usize,
    pub turns_queue: BoundedQueue<Turn>,
    pub uncommitted_turn: Turn,
    pub system_prompt_addition: Option<String>,
    /// The external caller's `final_response_topic`, captured once when the group chat starts.
    /// Every per-hop envelope published to a participant overwrites `final_response_topic` with
    /// the group's own returnpoint (so the participant answers back to the group, not the outside
    /// caller), so this is the only place that address survives until termination.
    pub origin_final_response_topic: Option<String>,
}

impl GroupchatData {
    /// Start a new group chat over the given participant topics.
    pub fn new(agent_topics: Vec<String>, system_prompt_addition: Option<String>) -> Self {
        Self::with_origin(agent_topics, system_prompt_addition, None)
    }

    /// Like [`GroupchatData::new`], additionally recording where the final `end_of_turn`
    /// notification should be published once the chat terminates.
    pub fn with_origin(
        agent_topics: Vec<String>,
        system_prompt_addition: Option<String>,
        origin_final_response_topic: Option<String>,
    ) -> Self {
        let capacity = agent_topics.len().saturating_sub(1);
        Self {
            agent_topics,
            turn_index: -1,
            consecutive_skips: 0,
            turns_queue: BoundedQueue::new(capacity),
            uncommitted_turn: Turn::new(),
            system_prompt_addition,
            origin_final_response_topic,
        }
    }

    pub fn participant_count(&self) -> usize {
        self.agent_topics.len()
    }

    pub fn increment_turn_index(&mut self) {
        self.turn_index += 1;
    }

    /// Record a skip (`consecutive_skips += 1`) or a non-skip (`consecutive_skips` reset to 0).
    pub fn record_skip(&mut self, skipped: bool) {
        if skipped {
            self.consecutive_skips += 1;
        } else {
            self.consecutive_skips = 0;
        }
    }

    pub fn commit_turn(&mut self) {
        let committed = std::mem::replace(&mut self.uncommitted_turn, Turn::new());
        self.turns_queue.push(committed);
    }

    /// `turn_index mod N` — the participant whose turn it is, per the round-robin schedule.
    pub fn current_participant_topic(&self) -> Option<&str> {
        if self.agent_topics.is_empty() {
            return None;
        }
        let n = self.agent_topics.len() as i64;
        let idx = self.turn_index.rem_euclid(n) as usize;
        self.agent_topics.get(idx).map(String::as_str)
    }

    /// Unanimous-skip termination: every participant skipped in its most recent turn.
    pub fn is_all_skipped(&self) -> bool {
        self.consecutive_skips >= self.participant_count()
    }

    /// Flatten the bounded turn-history window into one message list, oldest turn first.
    pub fn flat_messages_from_turns_queue(&self) -> Vec<Message> {
        self.turns_queue
            .iter()
            .flat_map(|turn| turn.messages.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_queue_evicts_oldest_past_capacity() {
        let mut q: BoundedQueue<i32> = BoundedQueue::new(2);
        q.push(1);
        q.push(2);
        q.push(3);
        let items: Vec<_> = q.iter().copied().collect();
        assert_eq!(items, vec![2, 3]);
    }

    #[test]
    fn groupchat_capacity_is_n_minus_one() {
        let data = GroupchatData::new(
            vec!["a".into(), "b".into(), "c".into()],
            None,
        );
        assert_eq!(data.turns_queue.capacity, 2);
    }

    #[test]
    fn round_robin_wraps_on_turn_index() {
        let mut data = GroupchatData::new(vec!["a".into(), "b".into(), "c".into()], None);
        data.increment_turn_index();
        assert_eq!(data.current_participant_topic(), Some("a"));
        data.increment_turn_index();
        assert_eq!(data.current_participant_topic(), Some("b"));
        data.increment_turn_index();
        assert_eq!(data.current_participant_topic(), Some("c"));
        data.increment_turn_index();
        assert_eq!(data.current_participant_topic(), Some("a"));
    }

    #[test]
    fn unanimous_skip_triggers_at_n() {
        let mut data = GroupchatData::new(vec!["a".into(), "b".into()], None);
        assert!(!data.is_all_skipped());
        data.record_skip(true);
        assert!(!data.is_all_skipped());
        data.record_skip(true);
        assert!(data.is_all_skipped());
    }

    #[test]
    fn non_skip_resets_consecutive_skips() {
        let mut data = GroupchatData::new(vec!["a".into(), "b".into()], None);
        data.record_skip(true);
        data.record_skip(false);
        assert_eq!(data.consecutive_skips, 0);
    }
}
