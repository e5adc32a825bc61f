//! Tagged request/response correlation over the backend event bus.
//!
//! Every outbound intent gets a fresh tag and a [`PendingOperation`]. Result
//! events are accepted only when both the tag and the conversation file
//! match a live record; accepting one drops the record, which unsubscribes
//! the success and failure counterparts together.
//!
//! The bridge never mutates the tree. It hands settled operations back to
//! the caller, who applies the delta.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bridge::pending::{PendingOperation, PendingTable};
use crate::core::applied::{Applied, IgnoreReason};
use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::{ConversationFile, NodeId, Tag};
use crate::protocol::events::{
    EditMessage, Envelope, EventKind, InboundEvent, Intent, NodeRequest, OutboundEvent,
    SendMessage, SwitchBranch,
};

/// Destination for outbound events (the transport lives outside this crate).
pub trait EventSink: Send + Sync {
    /// Hand one event to the transport.
    ///
    /// # Errors
    /// Returns `SyncError::TransportClosed` if the transport is gone.
    fn deliver(&self, event: OutboundEvent) -> SyncResult<()>;
}

impl EventSink for mpsc::UnboundedSender<OutboundEvent> {
    fn deliver(&self, event: OutboundEvent) -> SyncResult<()> {
        self.send(event).map_err(|_| SyncError::TransportClosed)
    }
}

/// Intent payload before correlation fields are attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Append a user message.
    Send {
        /// Node the message replies to.
        parent_id: Option<NodeId>,
        /// Message text.
        content: String,
        /// Ephemeral id shown until confirmed.
        client_node_id: NodeId,
    },
    /// Edit a user message into a new sibling.
    Edit {
        /// Node being edited.
        node_id: NodeId,
        /// Replacement text.
        content: String,
    },
    /// Regenerate an assistant reply.
    RetryAssistant {
        /// Assistant node to regenerate.
        node_id: NodeId,
    },
    /// Regenerate from a user message.
    RetryUser {
        /// User node to regenerate from.
        node_id: NodeId,
    },
    /// Show another sibling.
    SwitchBranch {
        /// Node currently shown.
        node_id: NodeId,
        /// 1-based target index.
        target_index: u32,
    },
    /// Delete one branch.
    DeleteBranch {
        /// Node to delete.
        node_id: NodeId,
    },
}

impl Request {
    /// Intent kind.
    #[must_use]
    pub const fn intent(&self) -> Intent {
        match self {
            Self::Send { .. } => Intent::Send,
            Self::Edit { .. } => Intent::Edit,
            Self::RetryAssistant { .. } => Intent::RetryAssistant,
            Self::RetryUser { .. } => Intent::RetryUser,
            Self::SwitchBranch { .. } => Intent::SwitchBranch,
            Self::DeleteBranch { .. } => Intent::DeleteBranch,
        }
    }

    /// Node the request is about.
    #[must_use]
    pub const fn target(&self) -> Option<&NodeId> {
        match self {
            Self::Send { client_node_id, .. } => Some(client_node_id),
            Self::Edit { node_id, .. }
            | Self::RetryAssistant { node_id }
            | Self::RetryUser { node_id }
            | Self::SwitchBranch { node_id, .. }
            | Self::DeleteBranch { node_id } => Some(node_id),
        }
    }

    fn into_event(self, envelope: Envelope) -> OutboundEvent {
        match self {
            Self::Send {
                parent_id,
                content,
                client_node_id,
            } => OutboundEvent::SendMessage(SendMessage {
                envelope,
                parent_id,
                content,
                client_node_id,
            }),
            Self::Edit { node_id, content } => OutboundEvent::EditMessage(EditMessage {
                envelope,
                node_id,
                content,
            }),
            Self::RetryAssistant { node_id } => {
                OutboundEvent::RetryAssistant(NodeRequest { envelope, node_id })
            }
            Self::RetryUser { node_id } => OutboundEvent::RetryUser(NodeRequest { envelope, node_id }),
            Self::SwitchBranch {
                node_id,
                target_index,
            } => OutboundEvent::SwitchBranch(SwitchBranch {
                envelope,
                node_id,
                target_index,
            }),
            Self::DeleteBranch { node_id } => {
                OutboundEvent::DeleteBranch(NodeRequest { envelope, node_id })
            }
        }
    }
}

/// Observer invoked for every delivered event of one kind.
pub type Listener = Box<dyn FnMut(&InboundEvent) + Send>;

/// Handle returned by [`CommandBridge::on`]; pass it to `unsubscribe`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
}

/// Correlation layer between client intents and backend results.
pub struct CommandBridge {
    conversation: ConversationFile,
    sink: Arc<dyn EventSink>,
    pending: PendingTable,
    listeners: HashMap<EventKind, Vec<(u64, Listener)>>,
    next_listener: u64,
    soft_timeout: Duration,
    disposed: bool,
}

impl CommandBridge {
    /// Create a bridge for one open conversation.
    #[must_use]
    pub fn new(conversation: ConversationFile, sink: Arc<dyn EventSink>, soft_timeout: Duration) -> Self {
        Self {
            conversation,
            sink,
            pending: PendingTable::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            soft_timeout,
            disposed: false,
        }
    }

    /// Conversation this bridge serves.
    #[must_use]
    pub const fn conversation(&self) -> &ConversationFile {
        &self.conversation
    }

    /// Tag the request, record it as pending, and hand it to the transport.
    ///
    /// # Errors
    /// Returns `TransportClosed` if the bridge was disposed or the sink is gone;
    /// nothing stays pending in that case.
    pub fn emit(&mut self, request: Request) -> SyncResult<Tag> {
        if self.disposed {
            return Err(SyncError::TransportClosed);
        }

        let intent = request.intent();
        let tag = Tag::generate(intent.tag_prefix());
        let op = PendingOperation::new(
            tag.clone(),
            intent,
            request.target().cloned(),
            self.soft_timeout,
        );
        let envelope = Envelope {
            conversation_file: self.conversation.clone(),
            tag: tag.clone(),
        };

        self.pending.insert(op);
        if let Err(err) = self.sink.deliver(request.into_event(envelope)) {
            self.pending.forget(&tag);
            warn!(%tag, %intent, "request could not be delivered");
            return Err(err);
        }

        debug!(%tag, %intent, "request emitted");
        Ok(tag)
    }

    /// Register an observer for one event kind.
    pub fn on(&mut self, kind: EventKind, listener: Listener) -> Subscription {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.entry(kind).or_default().push((id, listener));
        Subscription { id, kind }
    }

    /// Remove an observer. Returns `false` if it was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let Some(list) = self.listeners.get_mut(&subscription.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        before != list.len()
    }

    /// Match a result event against its pending request.
    ///
    /// Returns the settled operation when the tag and conversation match.
    /// Stream events and foreign, unknown, or already-settled tags are ignored.
    pub fn correlate(&mut self, event: &InboundEvent) -> Applied<PendingOperation> {
        let Some((intent, success)) = event.settles() else {
            return Applied::Ignored(IgnoreReason::NoChange);
        };
        if event.conversation_file() != Some(&self.conversation) {
            debug!(tag = %event.tag(), "result for another conversation ignored");
            return Applied::Ignored(IgnoreReason::ForeignConversation);
        }

        let tag = event.tag();
        match self.pending.get(tag) {
            None => {
                debug!(%tag, "late or duplicate result ignored");
                return Applied::Ignored(IgnoreReason::UnknownTag(tag.clone()));
            }
            Some(op) if op.intent != intent => {
                warn!(%tag, expected = %op.intent, got = %intent, "result kind does not match request");
                return Applied::Ignored(IgnoreReason::UnknownTag(tag.clone()));
            }
            Some(_) => {}
        }

        match self.pending.settle(tag, success) {
            Some(op) => Applied::Applied(op),
            None => Applied::Ignored(IgnoreReason::UnknownTag(tag.clone())),
        }
    }

    /// Deliver an event to registered observers.
    pub fn notify(&mut self, event: &InboundEvent) {
        if let Some(list) = self.listeners.get_mut(&event.kind()) {
            for (_, listener) in list.iter_mut() {
                listener(event);
            }
        }
    }

    /// In-flight operations.
    #[must_use]
    pub const fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Operations past their soft deadline.
    #[must_use]
    pub fn overdue(&self, now: Instant) -> Vec<&PendingOperation> {
        self.pending.overdue(now)
    }

    /// Whether the bridge was torn down.
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Drop every pending record and observer.
    ///
    /// Backend operations keep running; their results will find no record
    /// and be ignored.
    pub fn dispose(&mut self) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "dropping pending operations on dispose");
        }
        self.pending.clear();
        self.listeners.clear();
        self.disposed = true;
    }
}
