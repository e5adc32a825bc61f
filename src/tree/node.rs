//! Message node model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::NodeId;

/// Author role of a message node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// User input.
    User,
    /// Assistant response.
    Assistant,
    /// System message.
    System,
}

impl Role {
    /// Stable string form for the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(value.to_string()),
        }
    }
}

/// A single node of the conversation tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNode {
    /// Ephemeral or durable identifier.
    pub id: NodeId,
    /// Owning node, `None` for roots.
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    /// Author role.
    pub role: Role,
    /// Accumulated text; frozen once persisted.
    #[serde(default)]
    pub content: String,
    /// Server-issued timestamp, display only.
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MessageNode {
    /// Build a node with empty content.
    #[must_use]
    pub fn new(id: NodeId, parent_id: Option<NodeId>, role: Role) -> Self {
        Self {
            id,
            parent_id,
            role,
            content: String::new(),
            updated_at: None,
        }
    }

    /// Build an optimistic user node with a fresh ephemeral id.
    #[must_use]
    pub fn optimistic_user(parent_id: Option<NodeId>, content: impl Into<String>) -> Self {
        Self::new(NodeId::ephemeral(), parent_id, Role::User).with_content(content)
    }

    /// Build an empty assistant placeholder.
    #[must_use]
    pub fn placeholder(id: NodeId, parent_id: Option<NodeId>) -> Self {
        Self::new(id, parent_id, Role::Assistant)
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the server timestamp.
    #[must_use]
    pub fn with_updated_at(mut self, updated_at: Option<DateTime<Utc>>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Whether this node has no parent.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn test_node_wire_shape() {
        let json = r#"{"id":"u1","parent_id":null,"role":"user","content":"hi","updatedAt":"2024-05-01T10:00:00Z"}"#;
        let node: MessageNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.id, NodeId::from("u1"));
        assert!(node.is_root());
        assert_eq!(node.role, Role::User);
        assert!(node.updated_at.is_some());
    }

    #[test]
    fn test_optimistic_user_is_ephemeral() {
        let node = MessageNode::optimistic_user(Some(NodeId::from("root")), "hello");
        assert!(node.id.is_ephemeral());
        assert_eq!(node.content, "hello");
        assert_eq!(node.role, Role::User);
    }
}
