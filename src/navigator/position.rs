//! Sibling position indicators (`j` of `n`).
//!
//! Positions are never derived by scanning the local tree, which may lag
//! the backend. They are copied from the `latest` triple carried by the
//! same result that changed the branch.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::ids::NodeId;
use crate::protocol::events::BranchLatest;

/// 1-based position of a node within its sibling group.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct BranchPosition {
    /// 1-based index.
    pub current_index: u32,
    /// Group size.
    pub sibling_count: u32,
}

impl BranchPosition {
    /// Position of an only child.
    pub const ONLY_CHILD: Self = Self {
        current_index: 1,
        sibling_count: 1,
    };

    /// Whether a sibling exists to the left.
    #[must_use]
    pub const fn has_left(self) -> bool {
        self.current_index > 1
    }

    /// Whether a sibling exists to the right.
    #[must_use]
    pub const fn has_right(self) -> bool {
        self.current_index < self.sibling_count
    }

    /// Whether an indicator should be shown at all.
    #[must_use]
    pub const fn is_branched(self) -> bool {
        self.sibling_count > 1
    }
}

impl From<&BranchLatest> for BranchPosition {
    fn from(latest: &BranchLatest) -> Self {
        Self {
            current_index: latest.current_index,
            sibling_count: latest.sibling_count,
        }
    }
}

/// Last authoritative position per node.
#[derive(Clone, Debug, Default)]
pub struct BranchPositions {
    by_node: HashMap<NodeId, BranchPosition>,
}

impl BranchPositions {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the triple delivered with a result.
    ///
    /// The node may not be mirrored yet (a retry result can arrive before the
    /// placeholder), so the position is stored regardless.
    pub fn apply(&mut self, latest: &BranchLatest) {
        self.by_node
            .insert(latest.node_id.clone(), BranchPosition::from(latest));
    }

    /// Known position, defaulting to "only child".
    #[must_use]
    pub fn position(&self, node_id: &NodeId) -> BranchPosition {
        self.by_node
            .get(node_id)
            .copied()
            .unwrap_or(BranchPosition::ONLY_CHILD)
    }

    /// Indicator to display, `None` for only children.
    #[must_use]
    pub fn indicator(&self, node_id: &NodeId) -> Option<BranchPosition> {
        self.by_node
            .get(node_id)
            .copied()
            .filter(|p| p.is_branched())
    }

    /// Move a node's entry to its durable id.
    pub fn rewrite(&mut self, old_id: &NodeId, new_id: &NodeId) {
        if let Some(position) = self.by_node.remove(old_id) {
            self.by_node.insert(new_id.clone(), position);
        }
    }

    /// Forget removed nodes.
    pub fn remove_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a NodeId>) {
        for id in ids {
            self.by_node.remove(id);
        }
    }

    /// Whether any entry references the node.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.by_node.contains_key(node_id)
    }
}
