//! Branch intents to protocol round trips, and results back into state.

use serde::Deserialize;
use tracing::{debug, info};

use crate::bridge::command_bridge::{CommandBridge, Request};
use crate::core::applied::Applied;
use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::{NodeId, Tag};
use crate::navigator::position::{BranchPosition, BranchPositions};
use crate::protocol::events::{
    BranchLatest, DeleteOk, EditOk, RetryAssistantOk, RetryUserOk, RetryUserOutcome, SendOk,
    SwitchOk,
};
use crate::tree::node::{MessageNode, Role};
use crate::tree::store::ConversationTree;

/// Arrow the user pressed on a branch indicator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Previous sibling.
    Left,
    /// Next sibling, or a new one past the end.
    Right,
}

/// What a switch intent turns into.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SwitchPlan {
    /// Show an existing sibling.
    Switch {
        /// 1-based target index.
        target_index: u32,
    },
    /// Past the last sibling: create a new one.
    Regenerate(Request),
}

/// Owns branch indicators and drives branch operations through the bridge.
#[derive(Debug, Default)]
pub struct BranchNavigator {
    positions: BranchPositions,
}

impl BranchNavigator {
    /// Create a navigator with no known positions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current indicator table.
    #[must_use]
    pub const fn positions(&self) -> &BranchPositions {
        &self.positions
    }

    /// Decide what a switch intent means without touching the network.
    ///
    /// # Errors
    /// `BranchBoundary` when moving left from the first sibling (or right from
    /// a system node), `UnknownNode` / `NotPersisted` for invalid targets.
    pub fn plan_switch(
        &self,
        tree: &ConversationTree,
        node_id: &NodeId,
        direction: Direction,
    ) -> SyncResult<SwitchPlan> {
        let role = target_role(tree, node_id)?;
        let position = self.positions.position(node_id);

        match direction {
            Direction::Left if !position.has_left() => Err(SyncError::BranchBoundary {
                node_id: node_id.clone(),
            }),
            Direction::Left => Ok(SwitchPlan::Switch {
                target_index: position.current_index - 1,
            }),
            Direction::Right if position.has_right() => Ok(SwitchPlan::Switch {
                target_index: position.current_index + 1,
            }),
            Direction::Right => match role {
                Role::Assistant => Ok(SwitchPlan::Regenerate(Request::RetryAssistant {
                    node_id: node_id.clone(),
                })),
                Role::User => Ok(SwitchPlan::Regenerate(Request::RetryUser {
                    node_id: node_id.clone(),
                })),
                Role::System => Err(SyncError::BranchBoundary {
                    node_id: node_id.clone(),
                }),
            },
        }
    }

    /// Move to a neighbouring sibling, or regenerate past the end.
    ///
    /// # Errors
    /// Local rejections from [`Self::plan_switch`] (no request is sent) or a
    /// transport error from the bridge.
    pub fn switch_branch(
        &self,
        bridge: &mut CommandBridge,
        tree: &ConversationTree,
        node_id: &NodeId,
        direction: Direction,
    ) -> SyncResult<Tag> {
        let request = match self.plan_switch(tree, node_id, direction)? {
            SwitchPlan::Switch { target_index } => Request::SwitchBranch {
                node_id: node_id.clone(),
                target_index,
            },
            SwitchPlan::Regenerate(request) => {
                debug!(%node_id, "switch past last sibling becomes a retry");
                request
            }
        };
        bridge.emit(request)
    }

    /// Ask for a new sibling of an assistant reply.
    ///
    /// # Errors
    /// `UnknownNode` / `NotPersisted` for invalid targets, or a transport error.
    pub fn retry_assistant(
        &self,
        bridge: &mut CommandBridge,
        tree: &ConversationTree,
        node_id: &NodeId,
    ) -> SyncResult<Tag> {
        target_role(tree, node_id)?;
        bridge.emit(Request::RetryAssistant {
            node_id: node_id.clone(),
        })
    }

    /// Regenerate from a user message; the backend picks the flavour.
    ///
    /// # Errors
    /// `UnknownNode` / `NotPersisted` for invalid targets, or a transport error.
    pub fn retry_user(
        &self,
        bridge: &mut CommandBridge,
        tree: &ConversationTree,
        node_id: &NodeId,
    ) -> SyncResult<Tag> {
        target_role(tree, node_id)?;
        bridge.emit(Request::RetryUser {
            node_id: node_id.clone(),
        })
    }

    /// Edit a message into a new sibling.
    ///
    /// # Errors
    /// `UnknownNode` / `NotPersisted` for invalid targets, or a transport error.
    pub fn edit(
        &self,
        bridge: &mut CommandBridge,
        tree: &ConversationTree,
        node_id: &NodeId,
        content: String,
    ) -> SyncResult<Tag> {
        target_role(tree, node_id)?;
        bridge.emit(Request::Edit {
            node_id: node_id.clone(),
            content,
        })
    }

    /// Delete one branch. Nothing changes locally until the backend confirms.
    ///
    /// # Errors
    /// `UnknownNode` / `NotPersisted` for invalid targets, or a transport error.
    pub fn delete_branch(
        &self,
        bridge: &mut CommandBridge,
        tree: &ConversationTree,
        node_id: &NodeId,
    ) -> SyncResult<Tag> {
        target_role(tree, node_id)?;
        bridge.emit(Request::DeleteBranch {
            node_id: node_id.clone(),
        })
    }

    /// Fold a confirmed send into the tree.
    ///
    /// The optimistic node is moved to its durable id in the same scratch
    /// copy the payload is applied to. Other references to the client id are
    /// the caller's to move once this succeeds. The reply's position is
    /// recorded even though its placeholder may not exist yet.
    ///
    /// # Errors
    /// `InvariantViolation` if the durable id is taken or the declared path
    /// does not fit the mirror; the tree and positions are left unchanged.
    pub fn apply_send(&mut self, tree: &mut ConversationTree, ok: SendOk) -> SyncResult<Applied> {
        let mut scratch = tree.clone();
        if ok.client_node_id != ok.user_node.id && scratch.contains(&ok.client_node_id) {
            let _ = scratch.rewrite_id(&ok.client_node_id, &ok.user_node.id)?;
        }
        let mut records = Vec::with_capacity(ok.nodes.len() + 1);
        records.push(ok.user_node);
        records.extend(ok.nodes);
        let applied = self.apply_new_sibling(&mut scratch, ok.latest, ok.active_path, records)?;
        *tree = scratch;
        Ok(applied)
    }

    /// Fold a successful switch into the tree.
    ///
    /// # Errors
    /// `InvariantViolation` if the declared path does not fit the mirror; the
    /// tree and positions are left unchanged.
    pub fn apply_switch(&mut self, tree: &mut ConversationTree, ok: SwitchOk) -> SyncResult<Applied> {
        let mut scratch = tree.clone();
        scratch.merge_nodes(ok.nodes);
        let applied = scratch.set_active_path(ok.active_path)?;
        *tree = scratch;

        self.positions.apply(&ok.latest);
        info!(node_id = %ok.latest.node_id, index = ok.latest.current_index, count = ok.latest.sibling_count, "branch switched");
        Ok(applied)
    }

    /// Fold a successful assistant retry into the tree.
    ///
    /// The new sibling usually is not mirrored yet; its placeholder event
    /// follows and makes it the active leaf.
    ///
    /// # Errors
    /// `InvariantViolation` if a declared path does not fit the mirror.
    pub fn apply_retry_assistant(
        &mut self,
        tree: &mut ConversationTree,
        ok: RetryAssistantOk,
    ) -> SyncResult<Applied> {
        self.apply_new_sibling(tree, Some(ok.latest), ok.active_path, ok.nodes)
    }

    /// Fold a successful user retry into the tree, switching on the backend's
    /// explicit action.
    ///
    /// # Errors
    /// `InvariantViolation` if a declared path does not fit the mirror.
    pub fn apply_retry_user(&mut self, tree: &mut ConversationTree, ok: RetryUserOk) -> SyncResult<Applied> {
        let latest = match ok.outcome {
            RetryUserOutcome::RetryAssistant { latest } => {
                debug!(node_id = %latest.node_id, "user retry regenerated an existing reply");
                Some(latest)
            }
            RetryUserOutcome::NewPlaceholder { latest } => {
                debug!("user retry waits for a fresh placeholder");
                latest
            }
        };
        self.apply_new_sibling(tree, latest, ok.active_path, ok.nodes)
    }

    /// Fold a successful edit into the tree and show the new sibling.
    ///
    /// # Errors
    /// `InvariantViolation` if a declared path does not fit the mirror.
    pub fn apply_edit(&mut self, tree: &mut ConversationTree, ok: EditOk) -> SyncResult<Applied> {
        let mut scratch = tree.clone();
        scratch.merge_nodes(ok.nodes);
        let node_id = ok.node.id.clone();
        let parent_id = ok.node.parent_id.clone();
        let _ = scratch.apply_append(ok.node);

        match ok.active_path {
            Some(path) => {
                let _ = apply_declared_path(&mut scratch, path, None)?;
            }
            None => {
                let _ = scratch.activate_child(parent_id.as_ref(), &node_id);
            }
        }
        *tree = scratch;

        if let Some(latest) = &ok.latest {
            self.positions.apply(latest);
        }
        info!(%node_id, "edit applied as new sibling");
        Ok(Applied::done())
    }

    /// Fold a confirmed delete into the tree.
    ///
    /// Returns the ids that left the mirror. The backend's path is applied
    /// verbatim: shorter means the branch is gone from view, equal length
    /// means a sibling was auto-selected.
    ///
    /// # Errors
    /// `InvariantViolation` if the declared path does not fit the mirror; the
    /// tree and positions are left unchanged.
    pub fn apply_delete(
        &mut self,
        tree: &mut ConversationTree,
        ok: DeleteOk,
    ) -> SyncResult<Applied<Vec<NodeId>>> {
        let mut scratch = tree.clone();
        let removed = scratch.remove_subtree(&ok.deleted_id);
        scratch.merge_nodes(ok.nodes);
        let _ = scratch.set_active_path(ok.active_path)?;
        *tree = scratch;

        if let Applied::Applied(ids) = &removed {
            self.positions.remove_all(ids);
        }
        if let Some(latest) = &ok.latest {
            self.positions.apply(latest);
        }
        info!(node_id = %ok.deleted_id, "branch deleted");
        Ok(removed)
    }

    /// Record a position delivered outside a branch result (e.g. with a send).
    pub fn record(&mut self, latest: &BranchLatest) {
        self.positions.apply(latest);
    }

    /// Indicator for a node, if it has siblings.
    #[must_use]
    pub fn indicator(&self, node_id: &NodeId) -> Option<BranchPosition> {
        self.positions.indicator(node_id)
    }

    /// Move a node's indicator to its durable id.
    pub fn rewrite(&mut self, old_id: &NodeId, new_id: &NodeId) {
        self.positions.rewrite(old_id, new_id);
    }

    fn apply_new_sibling(
        &mut self,
        tree: &mut ConversationTree,
        latest: Option<BranchLatest>,
        active_path: Option<Vec<NodeId>>,
        nodes: Vec<MessageNode>,
    ) -> SyncResult<Applied> {
        let mut scratch = tree.clone();
        scratch.merge_nodes(nodes);
        if let Some(path) = active_path {
            let _ = apply_declared_path(&mut scratch, path, latest.as_ref().map(|l| &l.node_id))?;
        }
        *tree = scratch;

        match latest {
            Some(latest) => {
                info!(node_id = %latest.node_id, index = latest.current_index, count = latest.sibling_count, "branch position recorded");
                self.positions.apply(&latest);
                Ok(Applied::done())
            }
            None => Ok(Applied::done()),
        }
    }
}

/// Validate a protocol target: mirrored and already durable.
fn target_role(tree: &ConversationTree, node_id: &NodeId) -> SyncResult<Role> {
    let node = tree
        .get(node_id)
        .ok_or_else(|| SyncError::UnknownNode(node_id.clone()))?;
    if node_id.is_ephemeral() {
        return Err(SyncError::NotPersisted(node_id.clone()));
    }
    Ok(node.role)
}

/// Apply a backend-declared path; a trailing node whose placeholder has not
/// arrived yet is left for the placeholder to activate.
fn apply_declared_path(
    tree: &mut ConversationTree,
    mut path: Vec<NodeId>,
    awaiting: Option<&NodeId>,
) -> SyncResult<Applied> {
    let trailing_unknown = match (awaiting, path.last()) {
        (Some(leaf), Some(last)) => last == leaf && !tree.contains(leaf),
        _ => false,
    };
    if trailing_unknown {
        path.pop();
    }
    tree.set_active_path(path)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::core::ids::ConversationFile;
    use crate::protocol::events::{Envelope, OutboundEvent};

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn envelope() -> Envelope {
        Envelope {
            conversation_file: ConversationFile::from("c"),
            tag: Tag::from("t"),
        }
    }

    fn latest(node: &str, current: u32, count: u32) -> BranchLatest {
        BranchLatest {
            node_id: id(node),
            parent_id: None,
            current_index: current,
            sibling_count: count,
        }
    }

    /// root -> u1 -> {a1, a2}, active through a1.
    fn setup() -> (
        BranchNavigator,
        ConversationTree,
        CommandBridge,
        mpsc::UnboundedReceiver<OutboundEvent>,
    ) {
        let mut tree = ConversationTree::new();
        let _ = tree.apply_append(MessageNode::new(id("root"), None, Role::System));
        let _ = tree.apply_append(MessageNode::new(id("u1"), Some(id("root")), Role::User));
        let _ = tree.apply_append(MessageNode::new(id("a1"), Some(id("u1")), Role::Assistant));
        let _ = tree.apply_append(MessageNode::new(id("a2"), Some(id("u1")), Role::Assistant));
        let _ = tree.set_active_path(vec![id("root"), id("u1"), id("a1")]).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = CommandBridge::new(ConversationFile::from("c"), Arc::new(tx), Duration::from_secs(5));
        (BranchNavigator::new(), tree, bridge, rx)
    }

    #[test]
    fn test_left_at_first_sibling_sends_nothing() {
        let (mut nav, tree, mut bridge, mut rx) = setup();
        nav.record(&latest("a1", 1, 2));

        let err = nav
            .switch_branch(&mut bridge, &tree, &id("a1"), Direction::Left)
            .unwrap_err();
        assert!(matches!(err, SyncError::BranchBoundary { .. }));
        assert!(rx.try_recv().is_err());
        assert!(bridge.pending().is_empty());
    }

    #[test]
    fn test_right_inside_group_switches() {
        let (mut nav, tree, mut bridge, mut rx) = setup();
        nav.record(&latest("a1", 1, 2));

        nav.switch_branch(&mut bridge, &tree, &id("a1"), Direction::Right)
            .unwrap();
        match rx.try_recv().unwrap() {
            OutboundEvent::SwitchBranch(req) => assert_eq!(req.target_index, 2),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_right_past_end_regenerates() {
        let (mut nav, tree, mut bridge, mut rx) = setup();
        nav.record(&latest("a2", 2, 2));

        nav.switch_branch(&mut bridge, &tree, &id("a2"), Direction::Right)
            .unwrap();
        assert!(matches!(rx.try_recv().unwrap(), OutboundEvent::RetryAssistant(_)));

        nav.switch_branch(&mut bridge, &tree, &id("u1"), Direction::Right)
            .unwrap();
        assert!(matches!(rx.try_recv().unwrap(), OutboundEvent::RetryUser(_)));
    }

    #[test]
    fn test_unknown_and_optimistic_targets_are_rejected() {
        let (nav, mut tree, mut bridge, _rx) = setup();
        assert!(matches!(
            nav.retry_assistant(&mut bridge, &tree, &id("ghost")),
            Err(SyncError::UnknownNode(_))
        ));

        let optimistic = MessageNode::optimistic_user(Some(id("a1")), "hi");
        let optimistic_id = optimistic.id.clone();
        let _ = tree.apply_append(optimistic);
        assert!(matches!(
            nav.delete_branch(&mut bridge, &tree, &optimistic_id),
            Err(SyncError::NotPersisted(_))
        ));
    }

    #[test]
    fn test_apply_switch_uses_backend_triple() {
        let (mut nav, mut tree, _bridge, _rx) = setup();
        let ok = SwitchOk {
            envelope: envelope(),
            latest: latest("a2", 2, 2),
            active_path: vec![id("root"), id("u1"), id("a2"), id("u2")],
            nodes: vec![MessageNode::new(id("u2"), Some(id("a2")), Role::User)],
        };
        assert!(nav.apply_switch(&mut tree, ok).unwrap().is_applied());
        assert_eq!(tree.active_leaf(), Some(&id("u2")));
        assert_eq!(
            nav.indicator(&id("a2")),
            Some(BranchPosition {
                current_index: 2,
                sibling_count: 2
            })
        );
    }

    #[test]
    fn test_apply_switch_rejects_bad_path_without_side_effects() {
        let (mut nav, mut tree, _bridge, _rx) = setup();
        let ok = SwitchOk {
            envelope: envelope(),
            latest: latest("a2", 2, 2),
            active_path: vec![id("root"), id("a2")],
            nodes: vec![MessageNode::new(id("zz"), Some(id("a2")), Role::User)],
        };
        assert!(nav.apply_switch(&mut tree, ok).is_err());
        assert_eq!(tree.active_leaf(), Some(&id("a1")));
        assert!(!tree.contains(&id("zz")));
        assert!(nav.indicator(&id("a2")).is_none());
    }

    #[test]
    fn test_apply_retry_defers_unknown_leaf() {
        let (mut nav, mut tree, _bridge, _rx) = setup();
        let ok = RetryAssistantOk {
            envelope: envelope(),
            latest: latest("a3", 3, 3),
            active_path: Some(vec![id("root"), id("u1"), id("a3")]),
            nodes: Vec::new(),
        };
        let _ = nav.apply_retry_assistant(&mut tree, ok).unwrap();
        assert_eq!(tree.active_path(), &[id("root"), id("u1")]);
        assert_eq!(nav.positions().position(&id("a3")).current_index, 3);
    }

    #[test]
    fn test_apply_delete_only_child_shortens_path() {
        let (mut nav, mut tree, _bridge, _rx) = setup();
        let _ = tree.apply_append(MessageNode::new(id("u2"), Some(id("a1")), Role::User));
        let _ = tree.set_active_path(vec![id("root"), id("u1"), id("a1"), id("u2")])
            .unwrap();

        let ok = DeleteOk {
            envelope: envelope(),
            deleted_id: id("u2"),
            active_path: vec![id("root"), id("u1"), id("a1")],
            latest: None,
            nodes: Vec::new(),
        };
        let removed = nav.apply_delete(&mut tree, ok).unwrap().into_applied().unwrap();
        assert_eq!(removed, vec![id("u2")]);
        assert_eq!(tree.active_leaf(), Some(&id("a1")));
        assert!(tree.check_invariants().is_ok());
    }

    #[test]
    fn test_apply_delete_auto_selects_sibling() {
        let (mut nav, mut tree, _bridge, _rx) = setup();
        nav.record(&latest("a1", 1, 2));
        let ok = DeleteOk {
            envelope: envelope(),
            deleted_id: id("a1"),
            active_path: vec![id("root"), id("u1"), id("a2")],
            latest: Some(latest("a2", 1, 1)),
            nodes: Vec::new(),
        };
        let _ = nav.apply_delete(&mut tree, ok).unwrap();
        assert_eq!(tree.active_path().len(), 3);
        assert_eq!(tree.active_leaf(), Some(&id("a2")));
        assert!(!nav.positions().contains(&id("a1")));
        assert!(nav.indicator(&id("a2")).is_none());
    }

    #[test]
    fn test_apply_edit_activates_new_sibling() {
        let (mut nav, mut tree, _bridge, _rx) = setup();
        let ok = EditOk {
            envelope: envelope(),
            node: MessageNode::new(id("u1b"), Some(id("root")), Role::User).with_content("edited"),
            latest: Some(latest("u1b", 2, 2)),
            active_path: None,
            nodes: Vec::new(),
        };
        let _ = nav.apply_edit(&mut tree, ok).unwrap();
        assert_eq!(tree.active_path(), &[id("root"), id("u1b")]);
        assert_eq!(tree.children_of(&id("root")), &[id("u1"), id("u1b")]);
    }
}
