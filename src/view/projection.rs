//! Read-only projection of sync state into render-ready messages.
//!
//! A node's text is its session's visible buffer while a stream is open and
//! its persisted content otherwise. Presentation code never has to know
//! whether the node it draws is hidden, streaming, or finished.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bridge::pending::PendingTable;
use crate::core::ids::{ConversationFile, NodeId};
use crate::navigator::position::{BranchPosition, BranchPositions};
use crate::stream::reconciler::StreamReconciler;
use crate::tree::node::Role;
use crate::tree::store::ConversationTree;

/// Everything needed to draw one message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MessageView {
    /// Node id (ephemeral or durable).
    pub node_id: NodeId,
    /// Author role.
    pub role: Role,
    /// Text to display.
    pub text: String,
    /// A stream session is open for the node.
    pub is_streaming: bool,
    /// Open session that has not received any text yet.
    pub waiting: bool,
    /// Milliseconds spent waiting for the first chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_elapsed_ms: Option<u64>,
    /// Sibling indicator, only for branched nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_position: Option<BranchPosition>,
    /// Failure attached to the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// An operation on this node is past its soft timeout.
    pub is_slow: bool,
    /// Server timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The rendered conversation: the active path plus input state.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConversationView {
    /// Conversation being shown.
    pub conversation: Option<ConversationFile>,
    /// Messages on the active path, root first.
    pub messages: Vec<MessageView>,
    /// Whether a new message may be sent.
    pub can_send: bool,
    /// A stop was requested and the turn has not resolved yet.
    pub stopping: bool,
    /// Last send the backend refused, kept so the input can offer it again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_failure: Option<SendFailure>,
}

/// A refused send. Its optimistic message is no longer in the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SendFailure {
    /// Text the user tried to send.
    pub content: String,
    /// Backend failure message.
    pub message: String,
}

/// Borrowed state the projection reads from.
#[derive(Clone, Copy)]
pub struct ProjectionSource<'a> {
    /// Tree mirror.
    pub tree: &'a ConversationTree,
    /// Open stream sessions.
    pub streams: &'a StreamReconciler,
    /// Sibling indicators.
    pub positions: &'a BranchPositions,
    /// Per-node failure messages.
    pub errors: &'a HashMap<NodeId, String>,
    /// In-flight operations.
    pub pending: &'a PendingTable,
}

impl ProjectionSource<'_> {
    /// Project a single node, `None` if it is not mirrored.
    #[must_use]
    pub fn message(&self, node_id: &NodeId, now: Instant) -> Option<MessageView> {
        let node = self.tree.get(node_id)?;
        let session = self.streams.session(node_id);

        let text = session.map_or_else(
            || node.content.clone(),
            |s| s.visible_buffer().to_string(),
        );
        let waiting_elapsed = session.and_then(|s| s.waiting_elapsed(now));
        #[allow(clippy::cast_possible_truncation)]
        let waiting_elapsed_ms = waiting_elapsed.map(|d| d.as_millis() as u64);
        let is_slow = self
            .pending
            .any(|op| op.node_id.as_ref() == Some(node_id) && op.is_slow(now));

        Some(MessageView {
            node_id: node_id.clone(),
            role: node.role,
            text,
            is_streaming: session.is_some(),
            waiting: session.is_some_and(|s| s.is_waiting()),
            waiting_elapsed_ms,
            branch_position: self.positions.indicator(node_id),
            error_message: self.errors.get(node_id).cloned(),
            is_slow,
            updated_at: node.updated_at,
        })
    }

    /// Project every node on the active path.
    #[must_use]
    pub fn active_path(&self, now: Instant) -> Vec<MessageView> {
        self.tree
            .active_path()
            .iter()
            .filter_map(|id| self.message(id, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bridge::pending::PendingOperation;
    use crate::core::config::PlaybackConfig;
    use crate::core::ids::Tag;
    use crate::protocol::events::{BranchLatest, Intent};
    use crate::tree::node::MessageNode;

    struct Fixture {
        tree: ConversationTree,
        streams: StreamReconciler,
        positions: BranchPositions,
        errors: HashMap<NodeId, String>,
        pending: PendingTable,
    }

    impl Fixture {
        fn new() -> Self {
            let mut tree = ConversationTree::new();
            let _ = tree.apply_append(MessageNode::new(NodeId::from("u1"), None, Role::User).with_content("hi"));
            let _ = tree.apply_append(MessageNode::placeholder(NodeId::from("a1"), Some(NodeId::from("u1"))));
            let _ = tree.set_active_path(vec![NodeId::from("u1"), NodeId::from("a1")])
                .unwrap();
            Self {
                tree,
                streams: StreamReconciler::new(PlaybackConfig::default()),
                positions: BranchPositions::new(),
                errors: HashMap::new(),
                pending: PendingTable::new(),
            }
        }

        fn source(&self) -> ProjectionSource<'_> {
            ProjectionSource {
                tree: &self.tree,
                streams: &self.streams,
                positions: &self.positions,
                errors: &self.errors,
                pending: &self.pending,
            }
        }
    }

    #[test]
    fn test_persisted_content_without_session() {
        let f = Fixture::new();
        let view = f.source().message(&NodeId::from("u1"), Instant::now()).unwrap();
        assert_eq!(view.text, "hi");
        assert!(!view.is_streaming);
        assert!(view.branch_position.is_none());
    }

    #[test]
    fn test_visible_buffer_while_streaming() {
        let mut f = Fixture::new();
        let tag = Tag::from("send_1");
        let now = Instant::now();
        let _ = f.streams.open(tag.clone(), NodeId::from("a1"), now);

        let waiting = f.source().message(&NodeId::from("a1"), now).unwrap();
        assert!(waiting.waiting);
        assert_eq!(waiting.waiting_elapsed_ms, Some(0));

        let _ = f.streams.push_chunk(&tag, "Hello");
        let _ = f.streams.tick(Duration::ZERO);
        let view = f.source().message(&NodeId::from("a1"), now).unwrap();
        assert!(view.is_streaming);
        assert!(!view.waiting);
        assert_eq!(view.text, "H");
    }

    #[test]
    fn test_indicator_error_and_slow_flags() {
        let mut f = Fixture::new();
        f.positions.apply(&BranchLatest {
            node_id: NodeId::from("a1"),
            parent_id: None,
            current_index: 2,
            sibling_count: 3,
        });
        f.errors.insert(NodeId::from("a1"), "switch failed".to_string());
        f.pending.insert(PendingOperation::new(
            Tag::from("switch_1"),
            Intent::SwitchBranch,
            Some(NodeId::from("a1")),
            Duration::ZERO,
        ));

        let views = f.source().active_path(Instant::now());
        assert_eq!(views.len(), 2);
        let a1 = &views[1];
        assert_eq!(a1.branch_position.unwrap().current_index, 2);
        assert_eq!(a1.error_message.as_deref(), Some("switch failed"));
        assert!(a1.is_slow);
    }
}
