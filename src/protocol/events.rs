//! Typed request and result events exchanged with the backend.
//!
//! Every event name maps to one variant so downstream code never inspects
//! loose JSON. Wire shape: `{"event": "<NAME>", "payload": {...}}`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{ConversationFile, NodeId, Tag};
use crate::tree::node::MessageNode;

/// Kind of client intent a tag was issued for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// New user message.
    Send,
    /// Edited user message (new sibling).
    Edit,
    /// Regenerate an assistant reply.
    RetryAssistant,
    /// Regenerate from a user message.
    RetryUser,
    /// Move to another sibling.
    SwitchBranch,
    /// Remove a branch.
    DeleteBranch,
}

impl Intent {
    /// Prefix used when generating tags for this intent.
    #[must_use]
    pub const fn tag_prefix(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Edit => "edit",
            Self::RetryAssistant => "retry_ass",
            Self::RetryUser => "retry_user",
            Self::SwitchBranch => "switch",
            Self::DeleteBranch => "delete",
        }
    }

    /// Whether this intent starts an assistant turn that streams.
    #[must_use]
    pub const fn starts_turn(self) -> bool {
        matches!(
            self,
            Self::Send | Self::Edit | Self::RetryAssistant | Self::RetryUser
        )
    }

    /// Stable string form for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Edit => "edit",
            Self::RetryAssistant => "retry_assistant",
            Self::RetryUser => "retry_user",
            Self::SwitchBranch => "switch_branch",
            Self::DeleteBranch => "delete_branch",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Correlation fields shared by every request and result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Which open conversation the event belongs to.
    #[serde(rename = "conversationFile")]
    pub conversation_file: ConversationFile,
    /// Correlation token.
    pub tag: Tag,
}

// ===== Requests ==============================================================

/// `SEND_MESSAGE` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Node the message replies to.
    pub parent_id: Option<NodeId>,
    /// Message text.
    pub content: String,
    /// Ephemeral id shown until the backend confirms.
    pub client_node_id: NodeId,
}

/// `EDIT_MESSAGE` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMessage {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Node being edited.
    pub node_id: NodeId,
    /// Replacement text.
    pub content: String,
}

/// Payload for requests that only name a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequest {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Target node.
    pub node_id: NodeId,
}

/// `SWITCH_BRANCH` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchBranch {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Node currently shown in the sibling group.
    pub node_id: NodeId,
    /// 1-based sibling index to show instead.
    pub target_index: u32,
}

/// Request emitted to the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundEvent {
    /// Append a user message.
    SendMessage(SendMessage),
    /// Edit a user message into a new sibling.
    EditMessage(EditMessage),
    /// Regenerate an assistant reply.
    RetryAssistant(NodeRequest),
    /// Regenerate from a user message.
    RetryUser(NodeRequest),
    /// Show another sibling.
    SwitchBranch(SwitchBranch),
    /// Delete one branch.
    DeleteBranch(NodeRequest),
}

impl OutboundEvent {
    /// Correlation fields.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        match self {
            Self::SendMessage(p) => &p.envelope,
            Self::EditMessage(p) => &p.envelope,
            Self::RetryAssistant(p) | Self::RetryUser(p) | Self::DeleteBranch(p) => &p.envelope,
            Self::SwitchBranch(p) => &p.envelope,
        }
    }

    /// Correlation tag.
    #[must_use]
    pub const fn tag(&self) -> &Tag {
        &self.envelope().tag
    }

    /// Intent this request expresses.
    #[must_use]
    pub const fn intent(&self) -> Intent {
        match self {
            Self::SendMessage(_) => Intent::Send,
            Self::EditMessage(_) => Intent::Edit,
            Self::RetryAssistant(_) => Intent::RetryAssistant,
            Self::RetryUser(_) => Intent::RetryUser,
            Self::SwitchBranch(_) => Intent::SwitchBranch,
            Self::DeleteBranch(_) => Intent::DeleteBranch,
        }
    }
}

// ===== Results ===============================================================

/// Authoritative sibling position delivered with a mutation result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchLatest {
    /// Node the position describes.
    pub node_id: NodeId,
    /// Parent of the sibling group, when the backend includes it.
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    /// 1-based index within the sibling group.
    #[serde(rename = "currentIndex")]
    pub current_index: u32,
    /// Size of the sibling group.
    #[serde(rename = "siblingCount")]
    pub sibling_count: u32,
}

/// `SEND_MESSAGE_OK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOk {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Persisted user node (durable id).
    pub user_node: MessageNode,
    /// Ephemeral id the client displayed.
    pub client_node_id: NodeId,
    /// Position of the upcoming assistant reply, if known.
    #[serde(default)]
    pub latest: Option<BranchLatest>,
    /// Active path declared by the backend.
    #[serde(default)]
    pub active_path: Option<Vec<NodeId>>,
    /// Node records needed to apply `active_path`.
    #[serde(default)]
    pub nodes: Vec<MessageNode>,
}

/// `EDIT_MESSAGE_OK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOk {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// The new sibling holding the edited text.
    pub node: MessageNode,
    /// Position of the new sibling.
    #[serde(default)]
    pub latest: Option<BranchLatest>,
    /// Active path declared by the backend.
    #[serde(default)]
    pub active_path: Option<Vec<NodeId>>,
    /// Node records needed to apply `active_path`.
    #[serde(default)]
    pub nodes: Vec<MessageNode>,
}

/// `RETRY_ASSISTANT_OK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAssistantOk {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// New sibling and its position.
    pub latest: BranchLatest,
    /// Active path declared by the backend.
    #[serde(default)]
    pub active_path: Option<Vec<NodeId>>,
    /// Node records needed to apply `active_path`.
    #[serde(default)]
    pub nodes: Vec<MessageNode>,
}

/// Which path the backend took for a user-message retry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RetryUserOutcome {
    /// A later assistant reply existed; a new sibling of it was created.
    RetryAssistant {
        /// New sibling and its position.
        latest: BranchLatest,
    },
    /// No reply existed; a fresh placeholder follows.
    NewPlaceholder {
        /// Position of the placeholder, if the backend reports one.
        #[serde(default)]
        latest: Option<BranchLatest>,
    },
}

/// `RETRY_USER_OK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryUserOk {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Discriminated result.
    pub outcome: RetryUserOutcome,
    /// Active path declared by the backend.
    #[serde(default)]
    pub active_path: Option<Vec<NodeId>>,
    /// Node records needed to apply `active_path`.
    #[serde(default)]
    pub nodes: Vec<MessageNode>,
}

/// `SWITCH_BRANCH_OK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchOk {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Newly shown sibling and its position.
    pub latest: BranchLatest,
    /// Path through the newly shown sibling.
    pub active_path: Vec<NodeId>,
    /// Node records needed to apply `active_path`.
    #[serde(default)]
    pub nodes: Vec<MessageNode>,
}

/// `DELETE_BRANCH_OK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOk {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Node the backend removed.
    pub deleted_id: NodeId,
    /// Resulting active path.
    pub active_path: Vec<NodeId>,
    /// Position of the auto-selected sibling, if any.
    #[serde(default)]
    pub latest: Option<BranchLatest>,
    /// Node records needed to apply `active_path`.
    #[serde(default)]
    pub nodes: Vec<MessageNode>,
}

/// Payload shared by every `_FAIL` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Correlation fields.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Human readable reason.
    pub message: String,
}

/// `PLACEHOLDER_CREATE` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderCreate {
    /// Correlation fields; `tag` is the turn tag used by the stream events.
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Temporary id of the assistant node.
    #[serde(rename = "tempNodeId")]
    pub temp_node_id: NodeId,
    /// Parent of the placeholder; defaults to the active leaf.
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    /// Server timestamp.
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `CHUNK` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Turn tag.
    pub tag: Tag,
    /// Streamed text fragment.
    pub text: String,
}

/// `SAVED` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Saved {
    /// Turn tag.
    pub tag: Tag,
    /// Durable id of the assistant node.
    pub node_id: NodeId,
    /// Temporary id being replaced, when the backend echoes it.
    #[serde(rename = "tempNodeId", default)]
    pub temp_node_id: Option<NodeId>,
    /// Server timestamp.
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `ERROR` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    /// Turn tag.
    pub tag: Tag,
    /// Human readable reason.
    pub message: String,
}

/// `END` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct End {
    /// Turn tag.
    pub tag: Tag,
}

/// Event received from the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
#[serde(tag = "event", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundEvent {
    /// Send succeeded.
    SendMessageOk(SendOk),
    /// Send failed.
    SendMessageFail(Failure),
    /// Edit succeeded.
    EditMessageOk(EditOk),
    /// Edit failed.
    EditMessageFail(Failure),
    /// Assistant retry succeeded.
    RetryAssistantOk(RetryAssistantOk),
    /// Assistant retry failed.
    RetryAssistantFail(Failure),
    /// User retry succeeded.
    RetryUserOk(RetryUserOk),
    /// User retry failed.
    RetryUserFail(Failure),
    /// Branch switch succeeded.
    SwitchBranchOk(SwitchOk),
    /// Branch switch failed.
    SwitchBranchFail(Failure),
    /// Branch delete succeeded.
    DeleteBranchOk(DeleteOk),
    /// Branch delete failed.
    DeleteBranchFail(Failure),
    /// Assistant placeholder created.
    PlaceholderCreate(PlaceholderCreate),
    /// Streamed text.
    Chunk(Chunk),
    /// Assistant node persisted.
    Saved(Saved),
    /// Stream failed.
    Error(StreamFailure),
    /// Stream finished.
    End(End),
}

/// Fieldless event discriminant used to register listeners.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// `SEND_MESSAGE_OK`
    SendMessageOk,
    /// `SEND_MESSAGE_FAIL`
    SendMessageFail,
    /// `EDIT_MESSAGE_OK`
    EditMessageOk,
    /// `EDIT_MESSAGE_FAIL`
    EditMessageFail,
    /// `RETRY_ASSISTANT_OK`
    RetryAssistantOk,
    /// `RETRY_ASSISTANT_FAIL`
    RetryAssistantFail,
    /// `RETRY_USER_OK`
    RetryUserOk,
    /// `RETRY_USER_FAIL`
    RetryUserFail,
    /// `SWITCH_BRANCH_OK`
    SwitchBranchOk,
    /// `SWITCH_BRANCH_FAIL`
    SwitchBranchFail,
    /// `DELETE_BRANCH_OK`
    DeleteBranchOk,
    /// `DELETE_BRANCH_FAIL`
    DeleteBranchFail,
    /// `PLACEHOLDER_CREATE`
    PlaceholderCreate,
    /// `CHUNK`
    Chunk,
    /// `SAVED`
    Saved,
    /// `ERROR`
    Error,
    /// `END`
    End,
}

impl InboundEvent {
    /// Discriminant of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::SendMessageOk(_) => EventKind::SendMessageOk,
            Self::SendMessageFail(_) => EventKind::SendMessageFail,
            Self::EditMessageOk(_) => EventKind::EditMessageOk,
            Self::EditMessageFail(_) => EventKind::EditMessageFail,
            Self::RetryAssistantOk(_) => EventKind::RetryAssistantOk,
            Self::RetryAssistantFail(_) => EventKind::RetryAssistantFail,
            Self::RetryUserOk(_) => EventKind::RetryUserOk,
            Self::RetryUserFail(_) => EventKind::RetryUserFail,
            Self::SwitchBranchOk(_) => EventKind::SwitchBranchOk,
            Self::SwitchBranchFail(_) => EventKind::SwitchBranchFail,
            Self::DeleteBranchOk(_) => EventKind::DeleteBranchOk,
            Self::DeleteBranchFail(_) => EventKind::DeleteBranchFail,
            Self::PlaceholderCreate(_) => EventKind::PlaceholderCreate,
            Self::Chunk(_) => EventKind::Chunk,
            Self::Saved(_) => EventKind::Saved,
            Self::Error(_) => EventKind::Error,
            Self::End(_) => EventKind::End,
        }
    }

    /// Correlation tag carried by every event.
    #[must_use]
    pub const fn tag(&self) -> &Tag {
        match self {
            Self::SendMessageOk(p) => &p.envelope.tag,
            Self::EditMessageOk(p) => &p.envelope.tag,
            Self::RetryAssistantOk(p) => &p.envelope.tag,
            Self::RetryUserOk(p) => &p.envelope.tag,
            Self::SwitchBranchOk(p) => &p.envelope.tag,
            Self::DeleteBranchOk(p) => &p.envelope.tag,
            Self::SendMessageFail(p)
            | Self::EditMessageFail(p)
            | Self::RetryAssistantFail(p)
            | Self::RetryUserFail(p)
            | Self::SwitchBranchFail(p)
            | Self::DeleteBranchFail(p) => &p.envelope.tag,
            Self::PlaceholderCreate(p) => &p.envelope.tag,
            Self::Chunk(p) => &p.tag,
            Self::Saved(p) => &p.tag,
            Self::Error(p) => &p.tag,
            Self::End(p) => &p.tag,
        }
    }

    /// Conversation the event belongs to; stream events are matched by tag only.
    #[must_use]
    pub const fn conversation_file(&self) -> Option<&ConversationFile> {
        match self {
            Self::SendMessageOk(p) => Some(&p.envelope.conversation_file),
            Self::EditMessageOk(p) => Some(&p.envelope.conversation_file),
            Self::RetryAssistantOk(p) => Some(&p.envelope.conversation_file),
            Self::RetryUserOk(p) => Some(&p.envelope.conversation_file),
            Self::SwitchBranchOk(p) => Some(&p.envelope.conversation_file),
            Self::DeleteBranchOk(p) => Some(&p.envelope.conversation_file),
            Self::SendMessageFail(p)
            | Self::EditMessageFail(p)
            | Self::RetryAssistantFail(p)
            | Self::RetryUserFail(p)
            | Self::SwitchBranchFail(p)
            | Self::DeleteBranchFail(p) => Some(&p.envelope.conversation_file),
            Self::PlaceholderCreate(p) => Some(&p.envelope.conversation_file),
            Self::Chunk(_) | Self::Saved(_) | Self::Error(_) | Self::End(_) => None,
        }
    }

    /// For `_OK` / `_FAIL` events, the intent they answer and whether it succeeded.
    #[must_use]
    pub const fn settles(&self) -> Option<(Intent, bool)> {
        match self {
            Self::SendMessageOk(_) => Some((Intent::Send, true)),
            Self::SendMessageFail(_) => Some((Intent::Send, false)),
            Self::EditMessageOk(_) => Some((Intent::Edit, true)),
            Self::EditMessageFail(_) => Some((Intent::Edit, false)),
            Self::RetryAssistantOk(_) => Some((Intent::RetryAssistant, true)),
            Self::RetryAssistantFail(_) => Some((Intent::RetryAssistant, false)),
            Self::RetryUserOk(_) => Some((Intent::RetryUser, true)),
            Self::RetryUserFail(_) => Some((Intent::RetryUser, false)),
            Self::SwitchBranchOk(_) => Some((Intent::SwitchBranch, true)),
            Self::SwitchBranchFail(_) => Some((Intent::SwitchBranch, false)),
            Self::DeleteBranchOk(_) => Some((Intent::DeleteBranch, true)),
            Self::DeleteBranchFail(_) => Some((Intent::DeleteBranch, false)),
            Self::PlaceholderCreate(_)
            | Self::Chunk(_)
            | Self::Saved(_)
            | Self::Error(_)
            | Self::End(_) => None,
        }
    }
}
