//! In-memory mirror of the backend's conversation tree.
//!
//! The backend owns topology; this store applies the deltas it reports and
//! never repairs state on its own. Every mutation is a single `&mut self`
//! call, so readers never observe a half-applied delta.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::core::applied::{Applied, IgnoreReason};
use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::NodeId;
use crate::tree::node::MessageNode;

/// Node graph, child order, roots, and the active path of one conversation.
#[derive(Clone, Debug, Default)]
pub struct ConversationTree {
    nodes: HashMap<NodeId, MessageNode>,
    children: HashMap<NodeId, Vec<NodeId>>,
    roots: Vec<NodeId>,
    active_path: Vec<NodeId>,
}

impl ConversationTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&MessageNode> {
        self.nodes.get(id)
    }

    /// Whether a node is mirrored locally.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of mirrored nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children of a node in creation (= branch) order.
    #[must_use]
    pub fn children_of(&self, id: &NodeId) -> &[NodeId] {
        self.children.get(id).map_or(&[], Vec::as_slice)
    }

    /// Root ids in creation order.
    #[must_use]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Sibling group a node belongs to (including itself).
    #[must_use]
    pub fn siblings_of(&self, id: &NodeId) -> &[NodeId] {
        match self.nodes.get(id).and_then(|n| n.parent_id.as_ref()) {
            Some(parent) => self.children_of(parent),
            None => &self.roots,
        }
    }

    /// The rendered root-to-leaf sequence.
    #[must_use]
    pub fn active_path(&self) -> &[NodeId] {
        &self.active_path
    }

    /// Last node of the active path.
    #[must_use]
    pub fn active_leaf(&self) -> Option<&NodeId> {
        self.active_path.last()
    }

    /// Whether a node is currently rendered.
    #[must_use]
    pub fn is_active(&self, id: &NodeId) -> bool {
        self.active_path.contains(id)
    }

    /// Insert a node under its parent (or as a root).
    ///
    /// Does not touch the active path. Duplicate delivery and unknown parents
    /// are reported as ignored.
    pub fn apply_append(&mut self, node: MessageNode) -> Applied {
        if self.nodes.contains_key(&node.id) {
            debug!(node_id = %node.id, "append ignored: node already mirrored");
            return Applied::Ignored(IgnoreReason::Duplicate);
        }

        match &node.parent_id {
            Some(parent) if !self.nodes.contains_key(parent) => {
                debug!(node_id = %node.id, parent_id = %parent, "append ignored: unknown parent");
                return Applied::Ignored(IgnoreReason::UnknownNode(parent.clone()));
            }
            Some(parent) => {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .push(node.id.clone());
            }
            None => self.roots.push(node.id.clone()),
        }

        debug!(node_id = %node.id, role = %node.role, "node appended");
        self.nodes.insert(node.id.clone(), node);
        Applied::done()
    }

    /// Insert or refresh a batch of backend node records.
    ///
    /// Known nodes get their content and timestamp refreshed. Records may
    /// arrive in any order; parents are resolved across passes. Returns how
    /// many records changed the tree.
    pub fn merge_nodes(&mut self, records: Vec<MessageNode>) -> usize {
        let mut pending = records;
        let mut changed = 0;

        loop {
            let before = pending.len();
            let mut deferred = Vec::new();

            for record in pending {
                if let Some(existing) = self.nodes.get_mut(&record.id) {
                    if existing.content != record.content || existing.updated_at != record.updated_at {
                        existing.content = record.content;
                        existing.updated_at = record.updated_at;
                        changed += 1;
                    }
                    continue;
                }

                let parent_missing = record
                    .parent_id
                    .as_ref()
                    .is_some_and(|p| !self.nodes.contains_key(p));
                if parent_missing {
                    deferred.push(record);
                } else if self.apply_append(record).is_applied() {
                    changed += 1;
                }
            }

            if deferred.is_empty() || deferred.len() == before {
                for orphan in &deferred {
                    debug!(node_id = %orphan.id, "merge skipped node with unknown parent");
                }
                break;
            }
            pending = deferred;
        }

        changed
    }

    /// Replace a node's text.
    pub fn set_content(&mut self, id: &NodeId, content: impl Into<String>) -> Applied {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.content = content.into();
                Applied::done()
            }
            None => Applied::Ignored(IgnoreReason::UnknownNode(id.clone())),
        }
    }

    /// Record the server timestamp for a node.
    pub fn set_updated_at(&mut self, id: &NodeId, updated_at: DateTime<Utc>) -> Applied {
        match self.nodes.get_mut(id) {
            Some(node) if node.updated_at == Some(updated_at) => {
                Applied::Ignored(IgnoreReason::NoChange)
            }
            Some(node) => {
                node.updated_at = Some(updated_at);
                Applied::done()
            }
            None => Applied::Ignored(IgnoreReason::UnknownNode(id.clone())),
        }
    }

    /// Migrate a node from its ephemeral id to its durable id.
    ///
    /// Updates the node map, the parent's child list (keeping branch order),
    /// the node's own child list and its children's parent links, roots, and
    /// the active path in one step.
    ///
    /// # Errors
    /// Returns `InvariantViolation` if `new_id` is already used by another node.
    pub fn rewrite_id(&mut self, old_id: &NodeId, new_id: &NodeId) -> SyncResult<Applied> {
        if old_id == new_id {
            return Ok(Applied::Ignored(IgnoreReason::NoChange));
        }
        if !self.nodes.contains_key(old_id) {
            return Ok(Applied::Ignored(IgnoreReason::UnknownNode(old_id.clone())));
        }
        if self.nodes.contains_key(new_id) {
            error!(old_id = %old_id, new_id = %new_id, "rewrite target id already mirrored");
            return Err(SyncError::InvariantViolation(format!(
                "cannot rename {old_id} to {new_id}: id already in use"
            )));
        }

        let Some(mut node) = self.nodes.remove(old_id) else {
            return Ok(Applied::Ignored(IgnoreReason::UnknownNode(old_id.clone())));
        };
        node.id = new_id.clone();

        let siblings = match &node.parent_id {
            Some(parent) => self.children.get_mut(parent),
            None => Some(&mut self.roots),
        };
        if let Some(siblings) = siblings {
            replace_all(siblings, old_id, new_id);
        }

        if let Some(kids) = self.children.remove(old_id) {
            for kid in &kids {
                if let Some(child) = self.nodes.get_mut(kid) {
                    child.parent_id = Some(new_id.clone());
                }
            }
            self.children.insert(new_id.clone(), kids);
        }

        replace_all(&mut self.active_path, old_id, new_id);
        self.nodes.insert(new_id.clone(), node);

        debug!(old_id = %old_id, new_id = %new_id, "node id rewritten");
        Ok(Applied::done())
    }

    /// Replace the active path wholesale.
    ///
    /// # Errors
    /// Returns `InvariantViolation` if the path does not start at a root, names
    /// an unknown node, or skips a parent/child link. The tree is unchanged on
    /// error.
    pub fn set_active_path(&mut self, path: Vec<NodeId>) -> SyncResult<Applied> {
        self.validate_path(&path)?;
        if path == self.active_path {
            return Ok(Applied::Ignored(IgnoreReason::NoChange));
        }
        debug!(len = path.len(), "active path replaced");
        self.active_path = path;
        Ok(Applied::done())
    }

    /// Make `child` the active leaf directly under `parent`.
    ///
    /// The active path is cut after `parent` (or emptied for a new root) and
    /// `child` is pushed. Nothing happens when `parent` is not on the active
    /// path, since the user is looking at another branch.
    pub fn activate_child(&mut self, parent: Option<&NodeId>, child: &NodeId) -> Applied {
        let Some(node) = self.nodes.get(child) else {
            return Applied::Ignored(IgnoreReason::UnknownNode(child.clone()));
        };
        if node.parent_id.as_ref() != parent {
            return Applied::Ignored(IgnoreReason::NoChange);
        }

        let cut = match parent {
            Some(parent) => match self.active_path.iter().position(|id| id == parent) {
                Some(idx) => idx + 1,
                None => return Applied::Ignored(IgnoreReason::NoChange),
            },
            None => 0,
        };

        if self.active_path.len() == cut + 1 && self.active_path.last() == Some(child) {
            return Applied::Ignored(IgnoreReason::NoChange);
        }
        self.active_path.truncate(cut);
        self.active_path.push(child.clone());
        Applied::done()
    }

    /// Delete a node and every descendant.
    ///
    /// Used after the backend confirmed a delete or refused a send. Returns
    /// the removed ids. The active path is cut before the first removed node so it stays
    /// valid until the backend's path is applied.
    pub fn remove_subtree(&mut self, id: &NodeId) -> Applied<Vec<NodeId>> {
        let Some(node) = self.nodes.get(id) else {
            return Applied::Ignored(IgnoreReason::UnknownNode(id.clone()));
        };

        match node.parent_id.clone() {
            Some(parent) => {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.retain(|s| s != id);
                    if siblings.is_empty() {
                        self.children.remove(&parent);
                    }
                }
            }
            None => self.roots.retain(|r| r != id),
        }

        let mut removed = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(kids) = self.children.remove(&current) {
                stack.extend(kids);
            }
            self.nodes.remove(&current);
            removed.push(current);
        }

        if let Some(idx) = self.active_path.iter().position(|p| removed.contains(p)) {
            self.active_path.truncate(idx);
        }

        debug!(node_id = %id, count = removed.len(), "subtree removed");
        Applied::Applied(removed)
    }

    /// Check every structural invariant.
    ///
    /// # Errors
    /// Returns `InvariantViolation` describing the first broken rule.
    pub fn check_invariants(&self) -> SyncResult<()> {
        self.validate_path(&self.active_path)?;

        let mut seen = HashSet::new();
        for (parent, kids) in &self.children {
            if !self.nodes.contains_key(parent) {
                return Err(SyncError::InvariantViolation(format!(
                    "child list for unknown parent {parent}"
                )));
            }
            for kid in kids {
                let Some(node) = self.nodes.get(kid) else {
                    return Err(SyncError::InvariantViolation(format!(
                        "child {kid} of {parent} is not mirrored"
                    )));
                };
                if node.parent_id.as_ref() != Some(parent) {
                    return Err(SyncError::InvariantViolation(format!(
                        "child {kid} listed under {parent} but points elsewhere"
                    )));
                }
                if !seen.insert(kid) {
                    return Err(SyncError::InvariantViolation(format!(
                        "node {kid} listed twice"
                    )));
                }
            }
        }

        for root in &self.roots {
            if !seen.insert(root) {
                return Err(SyncError::InvariantViolation(format!(
                    "root {root} also listed as a child"
                )));
            }
        }

        if seen.len() != self.nodes.len() {
            return Err(SyncError::InvariantViolation(
                "some nodes are not reachable from any child list".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_path(&self, path: &[NodeId]) -> SyncResult<()> {
        let mut expected_parent: Option<&NodeId> = None;
        for (idx, id) in path.iter().enumerate() {
            let Some(node) = self.nodes.get(id) else {
                error!(node_id = %id, "active path names an unknown node");
                return Err(SyncError::InvariantViolation(format!(
                    "active path names unknown node {id}"
                )));
            };
            if node.parent_id.as_ref() != expected_parent {
                error!(node_id = %id, position = idx, "active path is not a parent/child chain");
                return Err(SyncError::InvariantViolation(format!(
                    "active path breaks at {id} (position {idx})"
                )));
            }
            expected_parent = Some(id);
        }
        Ok(())
    }
}

fn replace_all(ids: &mut [NodeId], old_id: &NodeId, new_id: &NodeId) {
    for slot in ids.iter_mut() {
        if slot == old_id {
            *slot = new_id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::Role;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn node(i: &str, parent: Option<&str>, role: Role) -> MessageNode {
        MessageNode::new(id(i), parent.map(id), role)
    }

    /// root -> u1 -> {a1, a2}
    fn sample() -> ConversationTree {
        let mut tree = ConversationTree::new();
        assert!(tree.apply_append(node("root", None, Role::System)).is_applied());
        assert!(tree.apply_append(node("u1", Some("root"), Role::User)).is_applied());
        assert!(tree.apply_append(node("a1", Some("u1"), Role::Assistant)).is_applied());
        assert!(tree.apply_append(node("a2", Some("u1"), Role::Assistant)).is_applied());
        let _ = tree.set_active_path(vec![id("root"), id("u1"), id("a1")]).unwrap();
        tree
    }

    #[test]
    fn test_append_keeps_branch_order() {
        let tree = sample();
        assert_eq!(tree.children_of(&id("u1")), &[id("a1"), id("a2")]);
        assert_eq!(tree.roots(), &[id("root")]);
        assert!(tree.check_invariants().is_ok());
    }

    #[test]
    fn test_append_does_not_move_active_path() {
        let mut tree = sample();
        let _ = tree.apply_append(node("a3", Some("u1"), Role::Assistant));
        assert_eq!(tree.active_leaf(), Some(&id("a1")));
    }

    #[test]
    fn test_duplicate_append_is_idempotent() {
        let mut tree = sample();
        let before = tree.clone();
        let outcome = tree.apply_append(node("a2", Some("u1"), Role::Assistant));
        assert_eq!(outcome, Applied::Ignored(IgnoreReason::Duplicate));
        assert_eq!(tree.children_of(&id("u1")), before.children_of(&id("u1")));
        assert_eq!(tree.len(), before.len());
    }

    #[test]
    fn test_append_under_unknown_parent_is_ignored() {
        let mut tree = sample();
        let outcome = tree.apply_append(node("x", Some("ghost"), Role::User));
        assert_eq!(outcome, Applied::Ignored(IgnoreReason::UnknownNode(id("ghost"))));
        assert!(!tree.contains(&id("x")));
    }

    #[test]
    fn test_rewrite_id_leaves_no_trace() {
        let mut tree = sample();
        let _ = tree.apply_append(node("c1", Some("a1"), Role::User));
        let _ = tree.set_active_path(vec![id("root"), id("u1"), id("a1"), id("c1")])
            .unwrap();

        assert!(tree.rewrite_id(&id("a1"), &id("a1_durable")).unwrap().is_applied());

        assert!(!tree.contains(&id("a1")));
        assert_eq!(tree.children_of(&id("u1")), &[id("a1_durable"), id("a2")]);
        assert_eq!(tree.children_of(&id("a1_durable")), &[id("c1")]);
        assert!(tree.children_of(&id("a1")).is_empty());
        assert_eq!(tree.get(&id("c1")).unwrap().parent_id, Some(id("a1_durable")));
        assert!(!tree.active_path().contains(&id("a1")));
        assert!(tree.active_path().contains(&id("a1_durable")));
        assert!(tree.check_invariants().is_ok());
    }

    #[test]
    fn test_rewrite_unknown_is_ignored() {
        let mut tree = sample();
        let outcome = tree.rewrite_id(&id("nope"), &id("x")).unwrap();
        assert!(!outcome.is_applied());
    }

    #[test]
    fn test_rewrite_onto_existing_id_is_rejected() {
        let mut tree = sample();
        let err = tree.rewrite_id(&id("a1"), &id("a2")).unwrap_err();
        assert!(matches!(err, SyncError::InvariantViolation(_)));
        assert!(tree.contains(&id("a1")));
    }

    #[test]
    fn test_set_active_path_rejects_broken_chain() {
        let mut tree = sample();
        let err = tree
            .set_active_path(vec![id("root"), id("a1")])
            .unwrap_err();
        assert!(err.is_defect());
        assert_eq!(tree.active_leaf(), Some(&id("a1")));
        assert_eq!(tree.active_path().len(), 3);
    }

    #[test]
    fn test_set_active_path_rejects_non_root_start() {
        let mut tree = sample();
        assert!(tree.set_active_path(vec![id("u1"), id("a1")]).is_err());
        assert!(tree.set_active_path(vec![id("root"), id("ghost")]).is_err());
    }

    #[test]
    fn test_activate_child_switches_branch() {
        let mut tree = sample();
        assert!(tree.activate_child(Some(&id("u1")), &id("a2")).is_applied());
        assert_eq!(tree.active_path(), &[id("root"), id("u1"), id("a2")]);
        assert!(!tree.activate_child(Some(&id("u1")), &id("a2")).is_applied());
    }

    #[test]
    fn test_activate_child_off_path_is_ignored() {
        let mut tree = sample();
        let _ = tree.apply_append(node("x", Some("a2"), Role::User));
        assert!(!tree.activate_child(Some(&id("a2")), &id("x")).is_applied());
        assert_eq!(tree.active_leaf(), Some(&id("a1")));
    }

    #[test]
    fn test_remove_subtree_drops_descendants() {
        let mut tree = sample();
        let _ = tree.apply_append(node("c1", Some("a1"), Role::User));
        let _ = tree.apply_append(node("c2", Some("c1"), Role::Assistant));

        let removed = tree.remove_subtree(&id("a1")).into_applied().unwrap();
        assert_eq!(removed.len(), 3);
        assert!(!tree.contains(&id("c2")));
        assert_eq!(tree.children_of(&id("u1")), &[id("a2")]);
        assert_eq!(tree.active_path(), &[id("root"), id("u1")]);
        assert!(tree.check_invariants().is_ok());
    }

    #[test]
    fn test_merge_nodes_resolves_out_of_order_parents() {
        let mut tree = sample();
        let changed = tree.merge_nodes(vec![
            node("c2", Some("c1"), Role::Assistant),
            node("c1", Some("a2"), Role::User),
            node("a2", Some("u1"), Role::Assistant).with_content("refreshed"),
        ]);
        assert_eq!(changed, 3);
        assert_eq!(tree.children_of(&id("c1")), &[id("c2")]);
        assert_eq!(tree.get(&id("a2")).unwrap().content, "refreshed");
        assert!(tree.check_invariants().is_ok());
    }
}
