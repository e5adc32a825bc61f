//! Single-writer owner of one open conversation's sync state.
//!
//! The tree mirror, stream sessions, branch indicators, and per-node errors
//! change only through `&mut self` methods here, one event or intent per
//! call. A reader holding `&self` therefore never sees a half-applied delta,
//! including the id rewrite that has to touch all four at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::bridge::command_bridge::{CommandBridge, EventSink, Listener, Request, Subscription};
use crate::bridge::pending::PendingOperation;
use crate::core::applied::{Applied, IgnoreReason};
use crate::core::config::SyncConfig;
use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::{ConversationFile, NodeId, Tag};
use crate::navigator::branch_ops::{BranchNavigator, Direction, SwitchPlan};
use crate::protocol::events::{BranchLatest, EventKind, InboundEvent, PlaceholderCreate, Saved};
use crate::protocol::wire::parse_inbound;
use crate::stream::reconciler::{FinishedStream, StreamReconciler};
use crate::tree::node::MessageNode;
use crate::tree::store::ConversationTree;
use crate::view::projection::{ConversationView, MessageView, ProjectionSource, SendFailure};

/// Sync state for one open conversation.
pub struct ConversationSync {
    tree: ConversationTree,
    navigator: BranchNavigator,
    streams: StreamReconciler,
    bridge: CommandBridge,
    errors: HashMap<NodeId, String>,
    send_failure: Option<SendFailure>,
    stopping: bool,
    disposed: bool,
}

impl ConversationSync {
    /// Create an empty mirror for a conversation.
    #[must_use]
    pub fn new(conversation: ConversationFile, sink: Arc<dyn EventSink>, config: &SyncConfig) -> Self {
        Self {
            tree: ConversationTree::new(),
            navigator: BranchNavigator::new(),
            streams: StreamReconciler::new(config.playback.clone()),
            bridge: CommandBridge::new(conversation, sink, config.bridge.soft_timeout),
            errors: HashMap::new(),
            send_failure: None,
            stopping: false,
            disposed: false,
        }
    }

    /// Seed the mirror from a backend snapshot.
    ///
    /// # Errors
    /// `InvariantViolation` if the path does not fit the nodes; nothing is
    /// loaded in that case.
    pub fn load(&mut self, nodes: Vec<MessageNode>, active_path: Vec<NodeId>) -> SyncResult<()> {
        let mut scratch = self.tree.clone();
        scratch.merge_nodes(nodes);
        let _ = scratch.set_active_path(active_path)?;
        info!(conversation = %self.bridge.conversation(), nodes = scratch.len(), "conversation loaded");
        self.tree = scratch;
        Ok(())
    }

    /// Seed sibling indicators delivered with a snapshot.
    pub fn load_positions(&mut self, positions: &[BranchLatest]) {
        for latest in positions {
            self.navigator.record(latest);
        }
    }

    /// Conversation this state belongs to.
    #[must_use]
    pub const fn conversation(&self) -> &ConversationFile {
        self.bridge.conversation()
    }

    /// Tree mirror.
    #[must_use]
    pub const fn tree(&self) -> &ConversationTree {
        &self.tree
    }

    /// Open stream sessions.
    #[must_use]
    pub const fn streams(&self) -> &StreamReconciler {
        &self.streams
    }

    /// Branch indicators.
    #[must_use]
    pub const fn navigator(&self) -> &BranchNavigator {
        &self.navigator
    }

    /// Failure message attached to a node.
    #[must_use]
    pub fn error_for(&self, node_id: &NodeId) -> Option<&str> {
        self.errors.get(node_id).map(String::as_str)
    }

    /// Dismiss a node's failure message.
    pub fn clear_error(&mut self, node_id: &NodeId) -> bool {
        self.errors.remove(node_id).is_some()
    }

    /// Last refused send, until the next send or a dismiss.
    #[must_use]
    pub const fn send_failure(&self) -> Option<&SendFailure> {
        self.send_failure.as_ref()
    }

    /// Dismiss the refused-send notice.
    pub fn dismiss_send_failure(&mut self) -> bool {
        self.send_failure.take().is_some()
    }

    /// Whether an assistant turn is requested or streaming.
    #[must_use]
    pub fn turn_in_flight(&self) -> bool {
        self.streams.is_streaming() || self.bridge.pending().any(|op| op.intent.starts_turn())
    }

    /// Whether a new message may be sent now.
    #[must_use]
    pub fn can_send(&self) -> bool {
        !self.disposed && !self.turn_in_flight()
    }

    /// Whether a stop is waiting for the current turn to resolve.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping && self.turn_in_flight()
    }

    // ===== Intents =========================================================

    /// Send a user message under the active leaf.
    ///
    /// The message is shown immediately under an ephemeral id and extends the
    /// active path.
    ///
    /// # Errors
    /// `SendInFlight` while a turn is running, `NotPersisted` if the active
    /// leaf is itself unconfirmed, or a transport error.
    pub fn send(&mut self, content: impl Into<String>) -> SyncResult<Tag> {
        self.ensure_turn_allowed()?;
        let parent = self.tree.active_leaf().cloned();
        if let Some(parent) = parent.as_ref().filter(|p| p.is_ephemeral()) {
            return Err(SyncError::NotPersisted(parent.clone()));
        }

        let node = MessageNode::optimistic_user(parent.clone(), content);
        let client_node_id = node.id.clone();
        let tag = self.bridge.emit(Request::Send {
            parent_id: parent.clone(),
            content: node.content.clone(),
            client_node_id: client_node_id.clone(),
        })?;

        let _ = self.tree.apply_append(node);
        let _ = self.tree.activate_child(parent.as_ref(), &client_node_id);
        self.send_failure = None;
        self.stopping = false;
        info!(%tag, node_id = %client_node_id, "message sent optimistically");
        Ok(tag)
    }

    /// Edit a message into a new sibling.
    ///
    /// # Errors
    /// `SendInFlight`, `UnknownNode`, `NotPersisted`, or a transport error.
    pub fn edit(&mut self, node_id: &NodeId, content: impl Into<String>) -> SyncResult<Tag> {
        self.ensure_turn_allowed()?;
        self.navigator
            .edit(&mut self.bridge, &self.tree, node_id, content.into())
    }

    /// Regenerate an assistant reply as a new sibling.
    ///
    /// # Errors
    /// `SendInFlight`, `UnknownNode`, `NotPersisted`, or a transport error.
    pub fn retry_assistant(&mut self, node_id: &NodeId) -> SyncResult<Tag> {
        self.ensure_turn_allowed()?;
        self.navigator
            .retry_assistant(&mut self.bridge, &self.tree, node_id)
    }

    /// Regenerate from a user message.
    ///
    /// # Errors
    /// `SendInFlight`, `UnknownNode`, `NotPersisted`, or a transport error.
    pub fn retry_user(&mut self, node_id: &NodeId) -> SyncResult<Tag> {
        self.ensure_turn_allowed()?;
        self.navigator
            .retry_user(&mut self.bridge, &self.tree, node_id)
    }

    /// Move to a neighbouring sibling; past the last one this regenerates.
    ///
    /// # Errors
    /// `BranchBoundary` (no request is sent), `SendInFlight` when the move
    /// would start a turn, `UnknownNode`, `NotPersisted`, or a transport error.
    pub fn switch_branch(&mut self, node_id: &NodeId, direction: Direction) -> SyncResult<Tag> {
        self.ensure_open()?;
        let plan = self.navigator.plan_switch(&self.tree, node_id, direction)?;
        if matches!(plan, SwitchPlan::Regenerate(_)) {
            self.ensure_turn_allowed()?;
        }
        self.navigator
            .switch_branch(&mut self.bridge, &self.tree, node_id, direction)
    }

    /// Delete one branch once the backend confirms.
    ///
    /// # Errors
    /// `UnknownNode`, `NotPersisted`, or a transport error.
    pub fn delete_branch(&mut self, node_id: &NodeId) -> SyncResult<Tag> {
        self.ensure_open()?;
        self.navigator
            .delete_branch(&mut self.bridge, &self.tree, node_id)
    }

    /// Client-side stop.
    ///
    /// Nothing is cancelled on the backend; sends simply stay blocked until
    /// the running turn resolves. Returns whether a turn was in flight.
    pub fn stop(&mut self) -> bool {
        if !self.turn_in_flight() {
            return false;
        }
        info!("stop requested; waiting for the running turn to resolve");
        self.stopping = true;
        true
    }

    // ===== Events ==========================================================

    /// Parse and apply one raw frame.
    ///
    /// # Errors
    /// `Protocol` for malformed frames, plus anything [`Self::handle_event`]
    /// returns.
    pub fn handle_frame(&mut self, frame: &str) -> SyncResult<Applied> {
        let event = parse_inbound(frame).inspect_err(|err| {
            warn!(%err, "dropping malformed frame");
        })?;
        self.handle_event(event)
    }

    /// Apply one inbound event.
    ///
    /// Stale, duplicate, and foreign events are reported as ignored. Observers
    /// registered with [`Self::on`] see only events that were applied.
    ///
    /// # Errors
    /// `InvariantViolation` when a result does not fit the mirror. The mirror
    /// is unchanged in that case.
    pub fn handle_event(&mut self, event: InboundEvent) -> SyncResult<Applied> {
        if self.disposed {
            debug!(tag = %event.tag(), "event after dispose ignored");
            return Ok(Applied::Ignored(IgnoreReason::NoChange));
        }

        let result = if event.settles().is_some() {
            match self.bridge.correlate(&event) {
                Applied::Applied(op) => self.apply_result(&op, event.clone()),
                Applied::Ignored(reason) => Ok(Applied::Ignored(reason)),
            }
        } else {
            self.apply_stream(event.clone(), Instant::now())
        };
        let applied = result.inspect_err(|err| error!(%err, tag = %event.tag(), "event rejected"))?;

        if applied.is_applied() {
            self.bridge.notify(&event);
        }
        Ok(applied)
    }

    /// Advance typewriter playback; returns the number of characters released.
    pub fn tick(&mut self, elapsed: Duration) -> usize {
        let outcome = self.streams.tick(elapsed);
        for finished in outcome.finished {
            self.commit(finished);
        }
        outcome.released
    }

    /// Whether playback has text left to release.
    #[must_use]
    pub fn has_backlog(&self) -> bool {
        self.streams.has_backlog()
    }

    /// Move a node to its durable id everywhere it is referenced.
    ///
    /// # Errors
    /// `InvariantViolation` if `new_id` is already in use; nothing changes.
    pub fn rewrite_id(&mut self, old_id: &NodeId, new_id: &NodeId) -> SyncResult<Applied> {
        let applied = self.tree.rewrite_id(old_id, new_id)?;
        if applied.is_applied() {
            self.follow_rename(old_id, new_id);
        }
        Ok(applied)
    }

    // ===== Observers and teardown ==========================================

    /// Observe applied events of one kind.
    pub fn on(&mut self, kind: EventKind, listener: Listener) -> Subscription {
        self.bridge.on(kind, listener)
    }

    /// Stop observing.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.bridge.unsubscribe(subscription)
    }

    /// Operations past their soft timeout, oldest first.
    #[must_use]
    pub fn overdue(&self, now: Instant) -> Vec<&PendingOperation> {
        self.bridge.overdue(now)
    }

    /// Next instant an in-flight operation becomes slow.
    #[must_use]
    pub fn next_soft_deadline(&self, now: Instant) -> Option<Instant> {
        self.bridge.pending().next_deadline(now)
    }

    /// Tear down: forget pending operations, observers, and streams.
    ///
    /// Backend work keeps running; its late results are ignored.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        info!(conversation = %self.bridge.conversation(), "conversation sync disposed");
        self.bridge.dispose();
        self.streams.clear();
        self.stopping = false;
        self.disposed = true;
    }

    /// Whether [`Self::dispose`] ran.
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ===== Projection ======================================================

    /// Render-ready view of one node.
    #[must_use]
    pub fn view(&self, node_id: &NodeId, now: Instant) -> Option<MessageView> {
        self.source().message(node_id, now)
    }

    /// Render-ready view of the active path.
    #[must_use]
    pub fn active_views(&self, now: Instant) -> Vec<MessageView> {
        self.source().active_path(now)
    }

    /// Whole conversation view, as published to the UI.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> ConversationView {
        ConversationView {
            conversation: Some(self.conversation().clone()),
            messages: self.active_views(now),
            can_send: self.can_send(),
            stopping: self.is_stopping(),
            send_failure: self.send_failure.clone(),
        }
    }

    fn source(&self) -> ProjectionSource<'_> {
        ProjectionSource {
            tree: &self.tree,
            streams: &self.streams,
            positions: self.navigator.positions(),
            errors: &self.errors,
            pending: self.bridge.pending(),
        }
    }

    // ===== Internals =======================================================

    fn ensure_open(&self) -> SyncResult<()> {
        if self.disposed {
            return Err(SyncError::TransportClosed);
        }
        Ok(())
    }

    fn ensure_turn_allowed(&self) -> SyncResult<()> {
        self.ensure_open()?;
        if self.turn_in_flight() {
            return Err(SyncError::SendInFlight);
        }
        Ok(())
    }

    fn apply_result(&mut self, op: &PendingOperation, event: InboundEvent) -> SyncResult<Applied> {
        if event.settles().is_some_and(|(_, success)| success) {
            if let Some(node_id) = &op.node_id {
                self.errors.remove(node_id);
            }
        }

        match event {
            InboundEvent::SendMessageOk(ok) => {
                let client_id = ok.client_node_id.clone();
                let durable_id = ok.user_node.id.clone();
                let renamed = client_id != durable_id && self.tree.contains(&client_id);
                let applied = self.navigator.apply_send(&mut self.tree, ok)?;
                if renamed {
                    self.follow_rename(&client_id, &durable_id);
                }
                Ok(applied)
            }
            InboundEvent::EditMessageOk(ok) => self.navigator.apply_edit(&mut self.tree, ok),
            InboundEvent::RetryAssistantOk(ok) => {
                self.navigator.apply_retry_assistant(&mut self.tree, ok)
            }
            InboundEvent::RetryUserOk(ok) => self.navigator.apply_retry_user(&mut self.tree, ok),
            InboundEvent::SwitchBranchOk(ok) => self.navigator.apply_switch(&mut self.tree, ok),
            InboundEvent::DeleteBranchOk(ok) => {
                let removed = self.navigator.apply_delete(&mut self.tree, ok)?;
                if let Applied::Applied(ids) = &removed {
                    self.forget_nodes(ids);
                }
                Ok(removed.discard())
            }
            InboundEvent::SendMessageFail(failure) => {
                warn!(tag = %op.tag, message = %failure.message, "send refused");
                self.discard_send(op, failure.message);
                Ok(Applied::done())
            }
            InboundEvent::EditMessageFail(failure)
            | InboundEvent::RetryAssistantFail(failure)
            | InboundEvent::RetryUserFail(failure)
            | InboundEvent::SwitchBranchFail(failure)
            | InboundEvent::DeleteBranchFail(failure) => {
                warn!(tag = %op.tag, intent = %op.intent, message = %failure.message, "operation failed");
                if let Some(node_id) = op.node_id.as_ref().filter(|id| self.tree.contains(id)) {
                    self.errors.insert(node_id.clone(), failure.message);
                }
                Ok(Applied::done())
            }
            InboundEvent::PlaceholderCreate(_)
            | InboundEvent::Chunk(_)
            | InboundEvent::Saved(_)
            | InboundEvent::Error(_)
            | InboundEvent::End(_) => Ok(Applied::Ignored(IgnoreReason::NoChange)),
        }
    }

    fn apply_stream(&mut self, event: InboundEvent, now: Instant) -> SyncResult<Applied> {
        match event {
            InboundEvent::PlaceholderCreate(placeholder) => Ok(self.open_placeholder(placeholder, now)),
            InboundEvent::Chunk(chunk) => Ok(self.streams.push_chunk(&chunk.tag, &chunk.text)),
            InboundEvent::Saved(saved) => self.confirm_saved(saved),
            InboundEvent::Error(failure) => Ok(match self.streams.fail(&failure.tag, &failure.message) {
                Applied::Applied(finished) => {
                    self.commit(finished);
                    Applied::done()
                }
                Applied::Ignored(reason) => Applied::Ignored(reason),
            }),
            InboundEvent::End(end) => Ok(match self.streams.end(&end.tag) {
                Applied::Applied(finished) => {
                    if let Some(finished) = finished {
                        self.commit(finished);
                    }
                    Applied::done()
                }
                Applied::Ignored(reason) => Applied::Ignored(reason),
            }),
            _ => Ok(Applied::Ignored(IgnoreReason::NoChange)),
        }
    }

    fn open_placeholder(&mut self, placeholder: PlaceholderCreate, now: Instant) -> Applied {
        let PlaceholderCreate {
            envelope,
            temp_node_id,
            parent_id,
            updated_at,
        } = placeholder;

        if &envelope.conversation_file != self.conversation() {
            debug!(tag = %envelope.tag, "placeholder for another conversation ignored");
            return Applied::Ignored(IgnoreReason::ForeignConversation);
        }
        if self.streams.is_retired(&envelope.tag) {
            return Applied::Ignored(IgnoreReason::RetiredTag(envelope.tag));
        }
        if self.streams.node_for_tag(&envelope.tag).is_some() || self.streams.session(&temp_node_id).is_some() {
            debug!(tag = %envelope.tag, node_id = %temp_node_id, "duplicate placeholder ignored");
            return Applied::Ignored(IgnoreReason::Duplicate);
        }

        // A result payload may already have delivered the node; its stream still opens.
        let parent = if let Some(existing) = self.tree.get(&temp_node_id) {
            debug!(tag = %envelope.tag, node_id = %temp_node_id, "placeholder for a mirrored node");
            existing.parent_id.clone()
        } else {
            let parent = parent_id.or_else(|| self.tree.active_leaf().cloned());
            let node = MessageNode::placeholder(temp_node_id.clone(), parent.clone()).with_updated_at(updated_at);
            if let Applied::Ignored(reason) = self.tree.apply_append(node) {
                return Applied::Ignored(reason);
            }
            parent
        };
        let _ = self.tree.activate_child(parent.as_ref(), &temp_node_id);
        self.streams.open(envelope.tag, temp_node_id, now)
    }

    fn confirm_saved(&mut self, saved: Saved) -> SyncResult<Applied> {
        let Some(old_id) = saved
            .temp_node_id
            .clone()
            .or_else(|| self.streams.node_for_tag(&saved.tag).cloned())
        else {
            debug!(tag = %saved.tag, "save for unknown turn ignored");
            return Ok(Applied::Ignored(IgnoreReason::UnknownTag(saved.tag)));
        };

        let applied = if old_id == saved.node_id {
            Applied::Ignored(IgnoreReason::NoChange)
        } else if !self.tree.contains(&old_id) && self.tree.contains(&saved.node_id) {
            Applied::Ignored(IgnoreReason::Duplicate)
        } else {
            self.rewrite_id(&old_id, &saved.node_id)?
        };
        self.streams.mark_saved(&saved.tag);

        if let Some(updated_at) = saved.updated_at {
            let _ = self.tree.set_updated_at(&saved.node_id, updated_at);
        }
        Ok(applied)
    }

    fn follow_rename(&mut self, old_id: &NodeId, new_id: &NodeId) {
        let _ = self.streams.rewrite(old_id, new_id);
        self.navigator.rewrite(old_id, new_id);
        if let Some(message) = self.errors.remove(old_id) {
            self.errors.insert(new_id.clone(), message);
        }
        info!(%old_id, %new_id, "node confirmed under durable id");
    }

    fn forget_nodes(&mut self, ids: &[NodeId]) {
        self.streams.remove_nodes(ids);
        for id in ids {
            self.errors.remove(id);
        }
    }

    /// Drop a refused send's optimistic message and restore the path it
    /// extended. The text is kept as a notice so it can be sent again.
    fn discard_send(&mut self, op: &PendingOperation, message: String) {
        let optimistic = op.node_id.as_ref().filter(|id| id.is_ephemeral());
        let content = optimistic
            .and_then(|id| self.tree.get(id))
            .map_or_else(String::new, |node| node.content.clone());
        if let Some(Applied::Applied(ids)) = optimistic.map(|id| self.tree.remove_subtree(id)) {
            debug!(removed = ids.len(), "optimistic message discarded");
            self.forget_nodes(&ids);
        }
        self.send_failure = Some(SendFailure { content, message });
    }

    fn commit(&mut self, finished: FinishedStream) {
        let _ = self.tree.set_content(&finished.node_id, finished.text);
        if let Some(message) = finished.error {
            self.errors.insert(finished.node_id, message);
        }
        if !self.turn_in_flight() {
            self.stopping = false;
        }
    }
}

impl std::fmt::Debug for ConversationSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSync")
            .field("conversation", self.conversation())
            .field("nodes", &self.tree.len())
            .field("pending", &self.bridge.pending().len())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}
