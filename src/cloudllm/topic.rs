//! Topic registry — resolves the public/private/return topics for a named node.
//!
//! A node describes its own wiring by returning a value from [`Registerable::wiring`]; the node
//! runner iterates that value and binds subscriptions. This is a deliberate simplification of the
//! donor system's attribute-decoration + `__init_subclass__` reflection (and its multi-inheritance
//! `Registrator` mix-in): no runtime reflection, just a struct returned from a method.

/// The topic roles a single node handler may bind to, each resolved from a `{name}` template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeWiring {
    /// Public input: broadcast of requests by capability (a consumer group if shared by more than
    /// one node).
    pub shared_subscribe_topic: Option<String>,
    /// Public output: completion of that capability.
    pub publish_topic: Option<String>,
    /// Private input for direct addressing, resolved from a template containing `{name}`.
    pub entrypoint_topic: Option<String>,
    /// Private input for responses from delegated sub-agents, resolved from a template containing
    /// `{name}`.
    pub returnpoint_topic: Option<String>,
}

impl NodeWiring {
    /// All topics this wiring subscribes to (shared, entrypoint, returnpoint — whichever are set).
    pub fn subscribe_topics(&self) -> Vec<String> {
        [
            &self.shared_subscribe_topic,
            &self.entrypoint_topic,
            &self.returnpoint_topic,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

/// Resolve a `{name}`-templated topic for a node, e.g. `"agent.private.{name}"` + `"chat"` →
/// `"agent.private.chat"`.
pub fn resolve_template(template: &str, name: &str) -> String {
    template.replace("{name}", name)
}

/// Implemented by every node so the runner can discover its wiring without reflection.
pub trait Registerable {
    /// Stable name used to resolve this node's private topics. `None` means the node has no
    /// private topics and is reachable only via its shared/public topic.
    fn name(&self) -> Option<&str>;

    /// This node's topic wiring, with any `{name}` templates already resolved against
    /// [`Registerable::name`].
    fn wiring(&self) -> NodeWiring;
}

/// Canonical topic-name templates, matching the naming convention nodes are expected to use.
pub mod templates {
    pub const AGENT_PUBLIC: &str = "agent.public.{name}";
    pub const AGENT_PRIVATE: &str = "agent.private.{name}";
    pub const AGENT_RETURN: &str = "agent.return.{name}";
    pub const TOOL_IN: &str = "tool.in.{name}";
    pub const TOOL_OUT: &str = "tool.out.{name}";
    pub const CHAT_IN: &str = "chat.in";
    pub const CHAT_OUT: &str = "chat.out";
    pub const GROUPCHAT_IN: &str = "groupchat.in.{name}";
    pub const GROUPCHAT_RETURN: &str = "groupchat.return.{name}";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_name_placeholder() {
        assert_eq!(
            resolve_template(templates::AGENT_PRIVATE, "billing"),
            "agent.private.billing"
        );
    }

    #[test]
    fn subscribe_topics_skips_unset_roles() {
        let wiring = NodeWiring {
            shared_subscribe_topic: Some("agent.public.billing".into()),
            entrypoint_topic: Some("agent.private.billing".into()),
            ..Default::default()
        };
        assert_eq!(
            wiring.subscribe_topics(),
            vec![
                "agent.public.billing".to_string(),
                "agent.private.billing".to_string(),
            ]
        );
    }
}
