//! Live tag -> intent records for in-flight requests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::ids::{NodeId, Tag};
use crate::protocol::events::Intent;

/// Lifecycle of one request.
///
/// `Idle -> Requested -> {Applied | Failed}`; both end states are terminal.
/// There is no client-side cancel: branch mutations are not safe to retry
/// blindly, so a slow request only changes what the UI says.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationState {
    /// Built but not sent.
    Idle,
    /// Sent, awaiting `_OK` / `_FAIL`.
    Requested,
    /// Success result applied.
    Applied,
    /// Failure result observed.
    Failed,
}

impl OperationState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Failed)
    }
}

/// A request awaiting its terminal event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingOperation {
    /// Correlation tag.
    pub tag: Tag,
    /// What the request asked for.
    pub intent: Intent,
    /// Node the request targets, if any.
    pub node_id: Option<NodeId>,
    /// Current lifecycle state.
    pub state: OperationState,
    /// When the request was emitted.
    pub issued_at: Instant,
    /// After this instant the request is reported as slow.
    pub soft_deadline: Instant,
}

impl PendingOperation {
    /// Build an idle record.
    #[must_use]
    pub fn new(tag: Tag, intent: Intent, node_id: Option<NodeId>, soft_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            tag,
            intent,
            node_id,
            state: OperationState::Idle,
            issued_at: now,
            soft_deadline: now + soft_timeout,
        }
    }

    /// Whether the soft deadline has passed.
    #[must_use]
    pub fn is_slow(&self, now: Instant) -> bool {
        self.state == OperationState::Requested && now >= self.soft_deadline
    }
}

/// Table of requested operations keyed by tag.
#[derive(Debug, Default)]
pub struct PendingTable {
    ops: HashMap<Tag, PendingOperation>,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation as requested.
    pub fn insert(&mut self, mut op: PendingOperation) {
        op.state = OperationState::Requested;
        self.ops.insert(op.tag.clone(), op);
    }

    /// Remove the record for a tag, moving it to its terminal state.
    ///
    /// Removing the single record drops both the success and the failure
    /// expectation for the tag, so a late duplicate finds nothing.
    pub fn settle(&mut self, tag: &Tag, success: bool) -> Option<PendingOperation> {
        let mut op = self.ops.remove(tag)?;
        op.state = if success {
            OperationState::Applied
        } else {
            OperationState::Failed
        };
        Some(op)
    }

    /// Drop a record without settling it.
    pub fn forget(&mut self, tag: &Tag) -> Option<PendingOperation> {
        self.ops.remove(tag)
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, tag: &Tag) -> Option<&PendingOperation> {
        self.ops.get(tag)
    }

    /// First in-flight operation targeting a node.
    #[must_use]
    pub fn for_node(&self, node_id: &NodeId) -> Option<&PendingOperation> {
        self.ops
            .values()
            .find(|op| op.node_id.as_ref() == Some(node_id))
    }

    /// Whether any in-flight operation matches the predicate.
    pub fn any(&self, mut predicate: impl FnMut(&PendingOperation) -> bool) -> bool {
        self.ops.values().any(|op| predicate(op))
    }

    /// Operations past their soft deadline, oldest first.
    #[must_use]
    pub fn overdue(&self, now: Instant) -> Vec<&PendingOperation> {
        let mut slow: Vec<_> = self.ops.values().filter(|op| op.is_slow(now)).collect();
        slow.sort_by_key(|op| op.issued_at);
        slow
    }

    /// Earliest soft deadline still ahead of `now`.
    #[must_use]
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.ops
            .values()
            .map(|op| op.soft_deadline)
            .filter(|deadline| *deadline > now)
            .min()
    }

    /// Number of in-flight operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.ops.clear();
    }
}
