//! Error types for the conversation sync engine.

use thiserror::Error;

use crate::core::ids::NodeId;

/// Sync engine error type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A tree delta would break the parent/child chain or an ownership rule.
    #[error("tree invariant violation: {0}")]
    InvariantViolation(String),
    /// Branch navigation past the first sibling.
    #[error("node {node_id} is already the first branch")]
    BranchBoundary {
        /// Node the navigation was requested on.
        node_id: NodeId,
    },
    /// A send or retry turn is still unresolved.
    #[error("a message is still in flight")]
    SendInFlight,
    /// Referenced node is not in the local mirror.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    /// Protocol calls need a durable id; the node is still optimistic.
    #[error("node {0} is not persisted yet")]
    NotPersisted(NodeId),
    /// Malformed or unexpected wire payload.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The outbound event sink is gone.
    #[error("transport closed")]
    TransportClosed,
}

impl SyncError {
    /// Whether the error reflects a client/backend desync rather than a user action.
    #[must_use]
    pub const fn is_defect(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::Protocol(_))
    }
}

/// Convenience result alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
